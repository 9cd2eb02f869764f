//! Per-asset work run through the analyzer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::analyzer::{AssetTask, TaskReport};
use crate::client::{Provider, RateLimitedClient};
use crate::config::ToolSpec;
use crate::error::{AnalysisError, StoreError};
use crate::llm::Prompt;
use crate::parse::{extract_risk_score, parse_classification};
use crate::prompts::{advisory_prompt, classification_prompt};
use crate::runner::{run_tool, ToolRun};
use crate::scanners::{parse_nmap_grepable, parse_nuclei_output};
use crate::store::AssetStore;

/// Ask the model what an asset is and store the answer.
pub struct ClassificationTask<P: Provider> {
    client: Arc<RateLimitedClient<P>>,
    store: Arc<AssetStore>,
}

impl<P: Provider> ClassificationTask<P> {
    pub fn new(client: Arc<RateLimitedClient<P>>, store: Arc<AssetStore>) -> Self {
        Self { client, store }
    }
}

#[async_trait]
impl<P> AssetTask for ClassificationTask<P>
where
    P: Provider<Request = Prompt, Response = String> + 'static,
{
    fn name(&self) -> &str {
        "classification"
    }

    async fn run(&self, asset: &str) -> Result<TaskReport, AnalysisError> {
        let prompt = classification_prompt(asset);
        let text = self.client.call(&prompt).await?;
        let update = parse_classification(&text)?.to_update();
        let asset = asset.to_string();
        with_store(&self.store, move |store| store.upsert_classification(&asset, &update)).await?;
        Ok(TaskReport::Saved { rows: 1 })
    }
}

/// Ask the model for exploitation advice from an asset's stored findings.
pub struct AdvisoryTask<P: Provider> {
    client: Arc<RateLimitedClient<P>>,
    store: Arc<AssetStore>,
}

impl<P: Provider> AdvisoryTask<P> {
    pub fn new(client: Arc<RateLimitedClient<P>>, store: Arc<AssetStore>) -> Self {
        Self { client, store }
    }
}

#[async_trait]
impl<P> AssetTask for AdvisoryTask<P>
where
    P: Provider<Request = Prompt, Response = String> + 'static,
{
    fn name(&self) -> &str {
        "advisory"
    }

    async fn run(&self, asset: &str) -> Result<TaskReport, AnalysisError> {
        let name = asset.to_string();
        let context = with_store(&self.store, move |store| store.asset_context(&name)).await?;
        let prompt = advisory_prompt(&context);
        let text = self.client.call(&prompt).await?;
        let text = text.trim();
        if text.is_empty() {
            info!(asset, "model returned no advice");
            return Ok(TaskReport::Skipped {
                reason: "empty response".into(),
            });
        }
        let score = extract_risk_score(text);
        let (asset, text) = (asset.to_string(), text.to_string());
        with_store(&self.store, move |store| store.upsert_advice(&asset, &text, score)).await?;
        Ok(TaskReport::Saved { rows: 1 })
    }
}

/// nuclei and nmap against one asset, findings parsed into the store.
///
/// Output lands in `<scan_dir>/nuclei/<asset>.jsonl` and
/// `<scan_dir>/nmap/<asset>.txt`. Whatever a tool wrote before failing or
/// timing out is still parsed and stored.
pub struct DeepScanTask {
    store: Arc<AssetStore>,
    scan_dir: PathBuf,
    nuclei: Option<ToolSpec>,
    nmap: Option<ToolSpec>,
    hard_limit_factor: u32,
}

impl DeepScanTask {
    pub fn new(store: Arc<AssetStore>, scan_dir: impl Into<PathBuf>, hard_limit_factor: u32) -> Self {
        Self {
            store,
            scan_dir: scan_dir.into(),
            nuclei: None,
            nmap: None,
            hard_limit_factor,
        }
    }

    pub fn with_nuclei(mut self, spec: ToolSpec) -> Self {
        self.nuclei = Some(spec);
        self
    }

    pub fn with_nmap(mut self, spec: ToolSpec) -> Self {
        self.nmap = Some(spec);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.nuclei.is_none() && self.nmap.is_none()
    }

    async fn scan(&self, tool: &str, spec: &ToolSpec, asset: &str, output: &Path) -> Option<(ToolRun, String)> {
        let Some(command) = spec.command(&[("target", asset)]) else {
            warn!(tool, "empty command template; scan skipped");
            return None;
        };
        let run = run_tool(tool, &command, output, spec.limits(self.hard_limit_factor)).await;
        let text = tokio::fs::read_to_string(output).await.unwrap_or_default();
        Some((run, text))
    }
}

#[async_trait]
impl AssetTask for DeepScanTask {
    fn name(&self) -> &str {
        "deep-scan"
    }

    async fn run(&self, asset: &str) -> Result<TaskReport, AnalysisError> {
        let stem = file_stem(asset);
        let mut rows = 0;
        let mut failed: Option<ToolRun> = None;

        if let Some(spec) = &self.nuclei {
            let path = self.scan_dir.join("nuclei").join(format!("{stem}.jsonl"));
            if let Some((run, text)) = self.scan("nuclei", spec, asset, &path).await {
                let findings = parse_nuclei_output(asset, &text);
                if !findings.is_empty() {
                    let name = asset.to_string();
                    rows += with_store(&self.store, move |store| {
                        store.append_vulnerability_findings(&name, &findings)
                    })
                    .await?;
                }
                if !run.success() {
                    failed.get_or_insert(run);
                }
            }
        }

        if let Some(spec) = &self.nmap {
            let path = self.scan_dir.join("nmap").join(format!("{stem}.txt"));
            if let Some((run, text)) = self.scan("nmap", spec, asset, &path).await {
                let findings = parse_nmap_grepable(&text);
                if !findings.is_empty() {
                    let name = asset.to_string();
                    rows += with_store(&self.store, move |store| store.append_port_findings(&name, &findings))
                        .await?;
                }
                if !run.success() {
                    failed.get_or_insert(run);
                }
            }
        }

        match failed {
            Some(run) => Err(AnalysisError::Tool {
                tool: run.tool,
                exit_code: run.exit_code,
            }),
            None if rows == 0 => Ok(TaskReport::Skipped {
                reason: "no findings".into(),
            }),
            None => Ok(TaskReport::Saved { rows }),
        }
    }
}

/// Run a store call on the blocking pool; SQLite locking must not stall a
/// runtime worker.
async fn with_store<T, F>(store: &Arc<AssetStore>, f: F) -> Result<T, AnalysisError>
where
    T: Send + 'static,
    F: FnOnce(&AssetStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| AnalysisError::Panicked(e.to_string()))?
        .map_err(AnalysisError::from)
}

/// Asset name reduced to characters safe in a file name.
fn file_stem(asset: &str) -> String {
    asset
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BackoffPolicy, Credential, CredentialPool};
    use crate::error::CallError;
    use crate::types::Purpose;

    struct Canned(String);

    #[async_trait]
    impl Provider for Canned {
        type Request = Prompt;
        type Response = String;

        fn name(&self) -> &str {
            "canned"
        }

        async fn send(&self, _: &Credential, _: &Prompt) -> Result<String, CallError> {
            Ok(self.0.clone())
        }
    }

    fn client(reply: &str) -> Arc<RateLimitedClient<Canned>> {
        Arc::new(RateLimitedClient::new(
            Canned(reply.to_string()),
            CredentialPool::from_keys("k"),
            BackoffPolicy::classification(),
        ))
    }

    #[test]
    fn file_stem_replaces_separators() {
        assert_eq!(file_stem("a.example.com"), "a.example.com");
        assert_eq!(file_stem("../x y"), ".._x_y");
    }

    #[tokio::test]
    async fn store_calls_run_off_the_runtime_thread() {
        let store = Arc::new(AssetStore::open_in_memory().unwrap());
        let caller = std::thread::current().id();
        let worker = with_store(&store, |store| {
            store.get_or_create("a.example.com")?;
            Ok(std::thread::current().id())
        })
        .await
        .unwrap();
        assert_ne!(worker, caller);
        assert_eq!(store.asset_names().unwrap(), vec!["a.example.com"]);

        let err = with_store(&store, |_| Err::<(), _>(StoreError::Poisoned)).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Store(StoreError::Poisoned)));
    }

    #[tokio::test]
    async fn classification_persists_reply() {
        let store = Arc::new(AssetStore::open_in_memory().unwrap());
        let task = ClassificationTask::new(
            client(r#"{"backend":"nginx","purpose":"API Server","vulnerabilities":"idor"}"#),
            store.clone(),
        );
        let report = task.run("api.example.com").await.unwrap();
        assert_eq!(report, TaskReport::Saved { rows: 1 });
        let asset = store.asset("api.example.com").unwrap().unwrap();
        assert_eq!(asset.purpose, Some(Purpose::ApiServer));
    }

    #[tokio::test]
    async fn classification_parse_failure_saves_nothing() {
        let store = Arc::new(AssetStore::open_in_memory().unwrap());
        let task = ClassificationTask::new(client("not json"), store.clone());
        assert!(matches!(
            task.run("x.example.com").await,
            Err(AnalysisError::Parse { .. })
        ));
        assert!(store.classification("x.example.com").unwrap().is_none());
    }

    #[tokio::test]
    async fn advisory_saves_text_and_score() {
        let store = Arc::new(AssetStore::open_in_memory().unwrap());
        let task = AdvisoryTask::new(client("Try default creds.\nRisk Score: 6.5"), store.clone());
        task.run("admin.example.com").await.unwrap();
        let advice = store.advice("admin.example.com").unwrap().unwrap();
        assert_eq!(advice.risk_score, 6.5);
        assert!(advice.advice_text.starts_with("Try default creds."));
    }

    #[tokio::test]
    async fn advisory_without_score_defaults_to_zero() {
        let store = Arc::new(AssetStore::open_in_memory().unwrap());
        let task = AdvisoryTask::new(client("Nothing stands out."), store.clone());
        task.run("www.example.com").await.unwrap();
        assert_eq!(store.advice("www.example.com").unwrap().unwrap().risk_score, 0.0);
    }

    #[tokio::test]
    async fn empty_advice_is_skipped() {
        let store = Arc::new(AssetStore::open_in_memory().unwrap());
        let task = AdvisoryTask::new(client("   "), store.clone());
        let report = task.run("www.example.com").await.unwrap();
        assert!(matches!(report, TaskReport::Skipped { .. }));
        assert!(store.advice("www.example.com").unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deep_scan_stores_partial_output_of_failing_tool() {
        let dir = tempfile::tempdir().unwrap();
        let nuclei_script = dir.path().join("nuclei.sh");
        std::fs::write(
            &nuclei_script,
            "printf '%s\\n' '{\"template-id\":\"exposed-git\",\"info\":{\"severity\":\"high\"}}'\nexit 2\n",
        )
        .unwrap();
        let nmap_script = dir.path().join("nmap.sh");
        std::fs::write(
            &nmap_script,
            "printf 'Host: 1.2.3.4 ()\\tPorts: 22/open/tcp//ssh///\\n'\n",
        )
        .unwrap();

        let store = Arc::new(AssetStore::open_in_memory().unwrap());
        let scan_dir = dir.path().join("scans");
        let task = DeepScanTask::new(store.clone(), &scan_dir, 2)
            .with_nuclei(ToolSpec::new(&format!("sh {} {{target}}", nuclei_script.display()), 5))
            .with_nmap(ToolSpec::new(&format!("sh {} {{target}}", nmap_script.display()), 5));

        match task.run("a.example.com").await {
            Err(AnalysisError::Tool { tool, exit_code }) => {
                assert_eq!(tool, "nuclei");
                assert_eq!(exit_code, 2);
            }
            other => panic!("expected tool failure, got {other:?}"),
        }
        let vulns = store.vulnerability_findings("a.example.com").unwrap();
        assert_eq!(vulns.len(), 1);
        assert_eq!(vulns[0].template_id, "exposed-git");
        let ports = store.port_findings("a.example.com").unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].service, "ssh");
        assert!(scan_dir.join("nuclei/a.example.com.jsonl").is_file());
    }
}
