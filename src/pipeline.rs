//! End-to-end run for one domain.
//!
//! Stages, in order: enumeration, merge, liveness, optional takeover check,
//! optional passive scan, deep scans, classification, advisory, export. Only
//! an empty enumeration result (or a broken store/output directory) stops the
//! run; everything else is logged and the next stage continues.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::analyzer::{analyze_all, AssetTask, BatchSummary};
use crate::client::{BackoffPolicy, CredentialPool, RateLimitedClient};
use crate::config::{PipelineConfig, ENUM_TOOLS};
use crate::error::PipelineError;
use crate::llm::ChatCompletions;
use crate::merge::{merge_into, read_hosts, usable_outputs, write_lines};
use crate::passive::{
    resolve_hosts, run_passive_scan, CensysProvider, PassiveScanReport, PassiveSource,
    PortLookup, ShodanProvider,
};
use crate::runner::run_tool;
use crate::store::AssetStore;
use crate::tasks::{AdvisoryTask, ClassificationTask, DeepScanTask};

pub const ALL_SUBDOMAINS_FILE: &str = "all_subdomains.txt";
pub const LIVE_SUBDOMAINS_FILE: &str = "live_subdomains.txt";
pub const TAKEOVER_FILE: &str = "subjack.txt";
pub const GRAPH_FILE: &str = "graph_data.json";

pub struct PassiveOptions {
    pub source: PassiveSource,
    pub credentials: CredentialPool,
}

/// What to run. Tool commands, timeouts and provider settings live in
/// [`PipelineConfig`].
pub struct RunOptions {
    pub domain: String,
    pub subtakeover: bool,
    pub passive: Option<PassiveOptions>,
    pub nuclei: bool,
    pub nmap: bool,
    pub classify: bool,
    pub advise: bool,
    /// Keys for the chat backend; required when `classify` or `advise` is set.
    pub llm_credentials: Option<CredentialPool>,
}

impl RunOptions {
    /// Enumeration and liveness only.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            subtakeover: false,
            passive: None,
            nuclei: false,
            nmap: false,
            classify: false,
            advise: false,
            llm_credentials: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct PipelineReport {
    pub all_hosts: usize,
    pub live_hosts: usize,
    pub passive: Option<PassiveScanReport>,
    pub deep_scan: Option<BatchSummary>,
    pub classification: Option<BatchSummary>,
    pub advisory: Option<BatchSummary>,
    pub graph_path: Option<PathBuf>,
}

pub struct Pipeline {
    config: PipelineConfig,
    options: RunOptions,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, options: RunOptions) -> Self {
        Self { config, options }
    }

    pub async fn run(mut self) -> Result<PipelineReport, PipelineError> {
        validate_domain(&self.options.domain)?;
        self.config.validate()?;
        let llm_credentials = self.options.llm_credentials.take();
        if (self.options.classify || self.options.advise)
            && llm_credentials.as_ref().map_or(true, CredentialPool::is_empty)
        {
            return Err(PipelineError::Config(
                "classification and advisory need at least one API key".into(),
            ));
        }

        let domain = self.options.domain.clone();
        let output = self.config.output_dir.clone();
        std::fs::create_dir_all(&output).map_err(|e| PipelineError::io(&output, e))?;
        let store = Arc::new(AssetStore::open(&self.config.db_path(&domain))?);
        info!(domain = %domain, output = %output.display(), "starting reconnaissance run");

        let mut report = PipelineReport::default();

        let all_path = output.join(ALL_SUBDOMAINS_FILE);
        let all_hosts = self.enumerate(&domain, &output, &all_path).await?;
        report.all_hosts = all_hosts.len();

        let live_path = output.join(LIVE_SUBDOMAINS_FILE);
        let live = self.check_live(&all_path, &live_path, &store).await?;
        report.live_hosts = live.len();
        if live.is_empty() {
            warn!(domain = %domain, "no live hosts found; stopping");
            return Ok(report);
        }
        info!(count = live.len(), "live hosts detected");

        if self.options.subtakeover {
            self.check_takeover(&live_path, &output).await;
        }

        if let Some(passive) = self.options.passive.take() {
            if passive.credentials.is_empty() {
                warn!(provider = passive.source.as_str(), "no credentials; passive scan skipped");
            } else {
                report.passive = Some(self.passive_scan(passive, &live, &output, &store).await?);
            }
        }

        let concurrency = self.config.concurrency;
        let mut deep = DeepScanTask::new(store.clone(), output.join("scans"), self.config.hard_limit_factor);
        if self.options.nuclei {
            if let Some(spec) = self.config.tool("nuclei") {
                deep = deep.with_nuclei(spec.clone());
            }
        }
        if self.options.nmap {
            if let Some(spec) = self.config.tool("nmap") {
                deep = deep.with_nmap(spec.clone());
            }
        }
        if !deep.is_empty() {
            report.deep_scan = Some(run_batch(&live, concurrency, deep).await);
        }

        if let Some(pool) = llm_credentials.filter(|_| self.options.classify || self.options.advise) {
            let llm = &self.config.llm;
            let client = Arc::new(RateLimitedClient::new(
                ChatCompletions::new(&llm.base_url, llm.chat_settings()),
                pool,
                BackoffPolicy::from(llm.backoff),
            ));
            if self.options.classify {
                let task = ClassificationTask::new(client.clone(), store.clone());
                report.classification = Some(run_batch(&live, concurrency, task).await);
            }
            if self.options.advise {
                // advice covers every stored asset, not only this run's live hosts
                let assets = store.asset_names()?;
                let task = AdvisoryTask::new(client, store.clone());
                report.advisory = Some(run_batch(&assets, concurrency, task).await);
            }
        }

        let graph_path = output.join(GRAPH_FILE);
        store.export_json(&graph_path)?;
        report.graph_path = Some(graph_path);

        info!(
            domain = %domain,
            all = report.all_hosts,
            live = report.live_hosts,
            "reconnaissance run complete"
        );
        Ok(report)
    }

    async fn enumerate(
        &self,
        domain: &str,
        output: &Path,
        merged: &Path,
    ) -> Result<Vec<String>, PipelineError> {
        let factor = self.config.hard_limit_factor;
        let mut candidates = Vec::new();
        for name in &self.config.enum_tools {
            if !ENUM_TOOLS.contains(&name.as_str()) {
                warn!(tool = %name, "unknown enumeration tool; skipped");
                continue;
            }
            let Some(spec) = self.config.tool(name) else {
                warn!(tool = %name, "no command configured; skipped");
                continue;
            };
            let Some(command) = spec.command(&[("domain", domain)]) else {
                warn!(tool = %name, "empty command template; skipped");
                continue;
            };
            let path = output.join(format!("{name}.txt"));
            let run = run_tool(name, &command, &path, spec.limits(factor)).await;
            candidates.push((run.success(), path));
        }
        let files = usable_outputs(candidates);
        info!(usable = files.len(), "enumeration finished");
        merge_into(&files, merged)
    }

    async fn check_live(
        &self,
        merged: &Path,
        live_path: &Path,
        store: &AssetStore,
    ) -> Result<Vec<String>, PipelineError> {
        let spec = self
            .config
            .tool("dnsx")
            .ok_or_else(|| PipelineError::Config("no dnsx command configured".into()))?;
        let input = merged.to_string_lossy().into_owned();
        let command = spec
            .command(&[("input", input.as_str())])
            .ok_or_else(|| PipelineError::Config("empty dnsx command".into()))?;

        let run = run_tool("dnsx", &command, live_path, spec.limits(self.config.hard_limit_factor)).await;
        if !run.success() {
            warn!(exit_code = run.exit_code, "liveness check failed; using partial output");
        }
        let mut live = match read_hosts(live_path) {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(error = %e, "no liveness output");
                Vec::new()
            }
        };
        live.sort();
        live.dedup();
        write_lines(live_path, &live)?;

        for host in &live {
            store.get_or_create(host)?;
        }
        Ok(live)
    }

    async fn check_takeover(&self, live_path: &Path, output: &Path) {
        let Some(spec) = self.config.tool("subjack") else {
            warn!("no subjack command configured; takeover check skipped");
            return;
        };
        let input = live_path.to_string_lossy().into_owned();
        let Some(command) = spec.command(&[("input", input.as_str())]) else {
            warn!("empty subjack command; takeover check skipped");
            return;
        };
        let out = output.join(TAKEOVER_FILE);
        let run = run_tool("subjack", &command, &out, spec.limits(self.config.hard_limit_factor)).await;
        info!(
            exit_code = run.exit_code,
            lines = run.lines,
            path = %out.display(),
            "takeover check finished"
        );
    }

    async fn passive_scan(
        &self,
        passive: PassiveOptions,
        live: &[String],
        output: &Path,
        store: &AssetStore,
    ) -> Result<PassiveScanReport, PipelineError> {
        let cfg = &self.config.passive;
        let timeout = Duration::from_secs(cfg.timeout_secs);
        let provider = match passive.source {
            PassiveSource::Shodan => {
                PortLookup::Shodan(ShodanProvider::new(&cfg.shodan_url).with_timeout(timeout))
            }
            PassiveSource::Censys => {
                PortLookup::Censys(CensysProvider::new(&cfg.censys_url).with_timeout(timeout))
            }
        };
        let client = RateLimitedClient::new(provider, passive.credentials, BackoffPolicy::from(cfg.backoff))
            .with_call_delay(Duration::from_millis(cfg.delay_ms));

        let targets = resolve_hosts(live).await;
        let csv = output.join(format!("{}_ports.csv", passive.source.as_str()));
        run_passive_scan(&client, &targets, cfg.limit, &csv, store).await
    }
}

async fn run_batch<T: AssetTask>(assets: &[String], concurrency: usize, task: T) -> BatchSummary {
    let outcomes = analyze_all(assets, concurrency, Arc::new(task)).await;
    BatchSummary::from_outcomes(&outcomes)
}

/// The domain names the database file, so it must be a bare host name.
fn validate_domain(domain: &str) -> Result<(), PipelineError> {
    let ok = !domain.is_empty()
        && !domain.starts_with('.')
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if ok {
        Ok(())
    } else {
        Err(PipelineError::Config(format!("invalid domain '{domain}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_validation() {
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("sub-1.example.co.uk").is_ok());
        assert!(validate_domain("").is_err());
        assert!(validate_domain("../etc").is_err());
        assert!(validate_domain("a b.com").is_err());
    }

    #[tokio::test]
    async fn ai_stages_without_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            output_dir: dir.path().join("out"),
            db_dir: dir.path().join("db"),
            ..Default::default()
        };
        let mut options = RunOptions::new("example.com");
        options.advise = true;
        let err = Pipeline::new(config, options).run().await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(!dir.path().join("out").exists());
    }
}
