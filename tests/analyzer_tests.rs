use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use recon_pipeline::analyzer::{analyze_all, BatchSummary};
use recon_pipeline::client::{BackoffPolicy, Credential, CredentialPool, Provider, RateLimitedClient};
use recon_pipeline::llm::Prompt;
use recon_pipeline::store::AssetStore;
use recon_pipeline::tasks::ClassificationTask;
use recon_pipeline::types::Purpose;
use recon_pipeline::{AnalysisError, CallError};

/// Answers every classification prompt with valid JSON, except for `host04`.
struct FakeModel {
    calls: AtomicU32,
}

#[async_trait]
impl Provider for FakeModel {
    type Request = Prompt;
    type Response = String;

    fn name(&self) -> &str {
        "fake-model"
    }

    async fn send(&self, _: &Credential, prompt: &Prompt) -> Result<String, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if prompt.user.contains("host04.example.com") {
            return Ok("I cannot classify this host.".to_string());
        }
        Ok(r#"```json
{"backend": "nginx", "vulnerabilities": ["weak tls"], "risk_score": 3, "direct_attack_advice": "", "manual_website_exploring_result": "", "purpose": "Public Website"}
```"#
            .to_string())
    }
}

struct AlwaysThrottled {
    calls: AtomicU32,
}

#[async_trait]
impl Provider for AlwaysThrottled {
    type Request = Prompt;
    type Response = String;

    fn name(&self) -> &str {
        "throttled"
    }

    async fn send(&self, _: &Credential, _: &Prompt) -> Result<String, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CallError::RateLimited("HTTP 429".into()))
    }
}

fn hosts(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("host{i:02}.example.com")).collect()
}

#[tokio::test]
async fn one_parse_failure_does_not_abort_the_batch() {
    let store = Arc::new(AssetStore::open_in_memory().unwrap());
    let client = Arc::new(RateLimitedClient::new(
        FakeModel {
            calls: AtomicU32::new(0),
        },
        CredentialPool::from_keys("k1,k2"),
        BackoffPolicy::classification(),
    ));
    let task = Arc::new(ClassificationTask::new(client.clone(), store.clone()));

    let outcomes = analyze_all(&hosts(10), 3, task).await;

    assert_eq!(outcomes.len(), 10);
    let summary = BatchSummary::from_outcomes(&outcomes);
    assert_eq!(summary.succeeded, 9);
    assert_eq!(summary.failed, 1);

    let failed: Vec<_> = outcomes.iter().filter(|o| o.result.is_err()).collect();
    assert_eq!(failed[0].asset, "host04.example.com");
    match &failed[0].result {
        Err(AnalysisError::Parse { raw, .. }) => assert!(raw.contains("cannot classify")),
        other => panic!("expected a parse failure, got {other:?}"),
    }

    assert!(store.classification("host04.example.com").unwrap().is_none());
    let saved = store.classification("host07.example.com").unwrap().unwrap();
    assert_eq!(saved.backend, "nginx");
    assert_eq!(saved.vulnerabilities_summary, "weak tls");
    assert_eq!(saved.purpose, Some(Purpose::PublicWebsite));
    assert_eq!(client.provider().calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn throttled_backend_fails_after_bounded_attempts() {
    let store = Arc::new(AssetStore::open_in_memory().unwrap());
    let client = Arc::new(RateLimitedClient::new(
        AlwaysThrottled {
            calls: AtomicU32::new(0),
        },
        CredentialPool::from_keys("only-key"),
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(4), 6),
    ));
    let task = Arc::new(ClassificationTask::new(client.clone(), store.clone()));

    let outcomes = analyze_all(&hosts(2), 2, task).await;

    for outcome in &outcomes {
        assert!(matches!(
            outcome.result,
            Err(AnalysisError::Call(CallError::Exhausted { attempts: 6 }))
        ));
    }
    assert_eq!(client.provider().calls.load(Ordering::SeqCst), 12);
    assert!(store.export_joined_view().unwrap().is_empty());
}
