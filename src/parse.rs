//! Interpretation of model responses.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::AnalysisError;
use crate::types::{clamp_risk_score, ClassificationUpdate, Purpose};

/// Fields of a classification response. Missing fields are empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassificationReply {
    pub backend: String,
    pub vulnerabilities: String,
    pub risk_score: f64,
    pub direct_attack_advice: String,
    pub manual_website_exploring_result: String,
    pub purpose: String,
}

impl ClassificationReply {
    pub fn to_update(&self) -> ClassificationUpdate {
        let purpose = self.purpose.trim();
        ClassificationUpdate {
            backend: self.backend.clone(),
            purpose: (!purpose.is_empty()).then(|| Purpose::from_label(purpose)),
            vulnerabilities_summary: self.vulnerabilities.clone(),
            exploration_summary: self.manual_website_exploring_result.clone(),
        }
    }
}

/// Remove a surrounding Markdown code fence (```` ``` ```` or ```` ```json ````).
pub fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse a classification response into its fields.
///
/// The response must be a single JSON object, optionally fenced. Fields may
/// be strings, numbers or lists of strings (joined with `"; "`).
pub fn parse_classification(text: &str) -> Result<ClassificationReply, AnalysisError> {
    let body = strip_code_fence(text);
    let value: Value = serde_json::from_str(body).map_err(|e| AnalysisError::Parse {
        reason: e.to_string(),
        raw: text.to_string(),
    })?;
    let Value::Object(obj) = value else {
        return Err(AnalysisError::Parse {
            reason: "expected a JSON object".into(),
            raw: text.to_string(),
        });
    };
    Ok(ClassificationReply {
        backend: text_field(&obj, "backend"),
        vulnerabilities: text_field(&obj, "vulnerabilities"),
        risk_score: number_field(&obj, "risk_score"),
        direct_attack_advice: text_field(&obj, "direct_attack_advice"),
        manual_website_exploring_result: text_field(&obj, "manual_website_exploring_result"),
        purpose: text_field(&obj, "purpose"),
    })
}

fn text_field(obj: &Map<String, Value>, key: &str) -> String {
    match obj.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("; "),
        Some(other) => other.to_string(),
    }
}

fn number_field(obj: &Map<String, Value>, key: &str) -> f64 {
    let raw = match obj.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    clamp_risk_score(raw.unwrap_or(0.0))
}

fn labelled_score() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)risk score[:\s]*([0-9]{1,2}(?:\.\d+)?)").expect("valid regex"))
}

fn out_of_ten() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)([0-9]{1,2}(?:\.\d+)?)\s*(?:/|out of)\s*10\b").expect("valid regex")
    })
}

/// Find the risk score in free-form advice.
///
/// `Risk Score: X` wins over `X/10` / `X out of 10`. Without either the score
/// is 0. The result is clamped to `[0, 10]`.
pub fn extract_risk_score(text: &str) -> f64 {
    [labelled_score(), out_of_ten()]
        .into_iter()
        .find_map(|re| re.captures(text)?.get(1)?.as_str().parse::<f64>().ok())
        .map(clamp_risk_score)
        .unwrap_or(0.0)
}
