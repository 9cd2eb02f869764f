use std::path::PathBuf;

/// Errors raised by the asset store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Outcome of a failed call through the rate-limited client.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// Provider signalled throttling; retried by the client.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Every attempt was throttled.
    #[error("still rate limited after {attempts} attempts")]
    Exhausted { attempts: u32 },
    /// Non-throttling failure: network, non-2xx status, bad credentials.
    #[error("provider error: {0}")]
    Provider(String),
    /// The provider answered but the body could not be understood.
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("no credentials configured")]
    NoCredentials,
}

/// Per-asset failure recorded by the analyzer. Never aborts the batch.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("could not parse response: {reason}")]
    Parse { reason: String, raw: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("tool {tool} failed with exit code {exit_code}")]
    Tool { tool: String, exit_code: i32 },
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Run-level errors. Only these stop the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no enumeration tool produced any host")]
    EmptyUniverse,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::EmptyUniverse => 1,
            Self::Config(_) => 2,
            Self::Store(_) | Self::Io { .. } => 3,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
