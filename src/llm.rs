//! Chat-completion backend used for classification and advisory prompts.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::{check_status, transport_error, Credential, Provider};
use crate::error::CallError;
use crate::passive::http_client;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com";

/// System and user prompt of one model call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".into(),
            temperature: 0.3,
            max_tokens: 1000,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `POST /v1/chat/completions`, bearer-key authenticated.
#[derive(Debug, Clone)]
pub struct ChatCompletions {
    http: reqwest::Client,
    base_url: String,
    settings: ChatSettings,
}

impl ChatCompletions {
    pub fn new(base_url: impl Into<String>, settings: ChatSettings) -> Self {
        Self {
            http: http_client(settings.timeout),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            settings,
        }
    }
}

#[async_trait]
impl Provider for ChatCompletions {
    type Request = Prompt;
    type Response = String;

    fn name(&self) -> &str {
        "chat-completions"
    }

    async fn send(&self, credential: &Credential, prompt: &Prompt) -> Result<String, CallError> {
        let Credential::ApiKey(key) = credential else {
            return Err(CallError::Provider("chat backend needs an API key".into()));
        };
        let body = ChatRequest {
            model: &self.settings.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        };
        let resp = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(resp.status())?;
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| CallError::Malformed(e.to_string()))?;
        first_content(parsed)
    }
}

fn first_content(resp: ChatResponse) -> Result<String, CallError> {
    resp.choices
        .into_iter()
        .next()
        .map(|c| c.message.content.unwrap_or_default().trim().to_string())
        .ok_or_else(|| CallError::Malformed("response has no choices".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_shape() {
        let body = ChatRequest {
            model: "gpt-4o",
            messages: [
                ChatMessage {
                    role: "system",
                    content: "sys",
                },
                ChatMessage {
                    role: "user",
                    content: "hi",
                },
            ],
            temperature: 0.3,
            max_tokens: 1000,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["messages"][1]["role"], "user");
        assert_eq!(v["max_tokens"], 1000);
    }

    #[test]
    fn content_is_trimmed() {
        let resp: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant","content":"  hello \n"}}]}"#)
                .unwrap();
        assert_eq!(first_content(resp).unwrap(), "hello");
    }

    #[test]
    fn no_choices_is_malformed() {
        let resp: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(first_content(resp), Err(CallError::Malformed(_))));
    }
}
