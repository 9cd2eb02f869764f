//! Bounded per-asset fan-out.
//!
//! [`analyze_all`] feeds asset names through a work channel to a fixed number
//! of workers. Each item runs in its own task so that a panic fails only that
//! asset; every asset yields exactly one [`AssetOutcome`].

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::error::AnalysisError;

pub const DEFAULT_CONCURRENCY: usize = 5;

/// Work done for one asset: build a request, call out, parse, persist.
#[async_trait]
pub trait AssetTask: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run(&self, asset: &str) -> Result<TaskReport, AnalysisError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskReport {
    /// Result persisted; `rows` is the number of rows written.
    Saved { rows: usize },
    /// Nothing worth persisting.
    Skipped { reason: String },
}

#[derive(Debug)]
pub struct AssetOutcome {
    pub asset: String,
    pub result: Result<TaskReport, AnalysisError>,
}

/// Counts over a batch of outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn from_outcomes(outcomes: &[AssetOutcome]) -> Self {
        outcomes.iter().fold(Self::default(), |mut s, o| {
            match &o.result {
                Ok(TaskReport::Saved { .. }) => s.succeeded += 1,
                Ok(TaskReport::Skipped { .. }) => s.skipped += 1,
                Err(_) => s.failed += 1,
            }
            s
        })
    }
}

/// Run `task` for every distinct asset with at most `max_concurrency` in
/// flight (minimum 1). Outcomes come back sorted by asset name.
pub async fn analyze_all<T: AssetTask>(
    assets: &[String],
    max_concurrency: usize,
    task: Arc<T>,
) -> Vec<AssetOutcome> {
    let unique: BTreeSet<&str> = assets.iter().map(String::as_str).collect();
    let total = unique.len();
    if total == 0 {
        return Vec::new();
    }

    let (work_tx, work_rx) = mpsc::unbounded_channel::<String>();
    for asset in unique {
        // receiver is alive until the workers below drop it
        let _ = work_tx.send(asset.to_string());
    }
    drop(work_tx);
    let work_rx = Arc::new(Mutex::new(work_rx));

    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<AssetOutcome>();
    let done = Arc::new(AtomicU64::new(0));
    let workers = max_concurrency.clamp(1, total);
    info!(task = task.name(), assets = total, workers, "starting batch");

    let mut set = JoinSet::new();
    for _ in 0..workers {
        let work_rx = work_rx.clone();
        let result_tx = result_tx.clone();
        let task = task.clone();
        let done = done.clone();
        set.spawn(async move {
            loop {
                let next = work_rx.lock().await.recv().await;
                let Some(asset) = next else { break };

                let item_task = task.clone();
                let item = asset.clone();
                let result = tokio::spawn(async move { item_task.run(&item).await })
                    .await
                    .unwrap_or_else(|e| Err(AnalysisError::Panicked(panic_message(e))));

                match &result {
                    Ok(report) => debug!(task = task.name(), asset = %asset, ?report, "asset done"),
                    Err(e) => warn!(task = task.name(), asset = %asset, error = %e, "asset failed"),
                }
                let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(task = task.name(), done = n, total, "batch progress");

                if result_tx.send(AssetOutcome { asset, result }).is_err() {
                    break;
                }
            }
        });
    }
    drop(result_tx);

    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "analysis worker ended abnormally");
        }
    }

    let mut outcomes = Vec::with_capacity(total);
    while let Some(outcome) = result_rx.recv().await {
        outcomes.push(outcome);
    }
    outcomes.sort_by(|a, b| a.asset.cmp(&b.asset));

    let summary = BatchSummary::from_outcomes(&outcomes);
    info!(
        task = task.name(),
        succeeded = summary.succeeded,
        skipped = summary.skipped,
        failed = summary.failed,
        "batch finished"
    );
    outcomes
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
