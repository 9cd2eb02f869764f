use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analyzer::DEFAULT_CONCURRENCY;
use crate::client::BackoffPolicy;
use crate::error::PipelineError;
use crate::llm::{ChatSettings, OPENAI_BASE_URL};
use crate::passive::{CENSYS_BASE_URL, SHODAN_BASE_URL};
use crate::runner::{RunLimits, ToolCommand, DEFAULT_HARD_LIMIT_FACTOR};

const MAX_CONFIG_BYTES: u64 = 1024 * 1024;

/// Enumeration tools accepted by `--enum-tools`.
pub const ENUM_TOOLS: [&str; 4] = ["subfinder", "amass", "assetfinder", "gobuster"];

/// Command template and time budget of one external tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Whitespace-separated template; `{name}` placeholders are substituted
    /// per argument.
    pub command: String,
    pub timeout_secs: u64,
}

impl ToolSpec {
    pub fn new(command: &str, timeout_secs: u64) -> Self {
        Self {
            command: command.to_string(),
            timeout_secs,
        }
    }

    pub fn command(&self, vars: &[(&str, &str)]) -> Option<ToolCommand> {
        ToolCommand::from_template(&self.command, vars)
    }

    pub fn limits(&self, hard_limit_factor: u32) -> RunLimits {
        RunLimits::with_hard_limit_factor(Duration::from_secs(self.timeout_secs), hard_limit_factor)
    }
}

fn default_tools() -> BTreeMap<String, ToolSpec> {
    [
        ("subfinder", "subfinder -d {domain} -silent", 120),
        ("amass", "amass enum -passive -d {domain}", 180),
        ("assetfinder", "assetfinder --subs-only {domain}", 60),
        (
            "gobuster",
            "gobuster dns -d {domain} -w /usr/share/seclists/Discovery/DNS/subdomains-top1million-110000.txt -t 100 --quiet",
            90,
        ),
        ("dnsx", "dnsx -l {input} -a -silent", 60),
        ("subjack", "subjack -w {input} -t 100 -timeout 30 -ssl -v", 300),
        ("nuclei", "nuclei -u {target} -jsonl -silent -rl 20", 300),
        ("nmap", "nmap -sV -T4 --top-ports 1000 -oG - {target}", 300),
    ]
    .into_iter()
    .map(|(name, command, timeout)| (name.to_string(), ToolSpec::new(command, timeout)))
    .collect()
}

/// Exponential backoff settings in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl From<BackoffPolicy> for BackoffConfig {
    fn from(p: BackoffPolicy) -> Self {
        Self {
            initial_ms: p.initial.as_millis() as u64,
            max_delay_ms: p.max_delay.as_millis() as u64,
            max_attempts: p.max_attempts,
        }
    }
}

impl From<BackoffConfig> for BackoffPolicy {
    fn from(c: BackoffConfig) -> Self {
        BackoffPolicy::new(
            Duration::from_millis(c.initial_ms),
            Duration::from_millis(c.max_delay_ms),
            c.max_attempts,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassiveConfig {
    /// Pause after every provider call.
    pub delay_ms: u64,
    /// Maximum number of addresses looked up.
    pub limit: Option<usize>,
    pub shodan_url: String,
    pub censys_url: String,
    pub timeout_secs: u64,
    pub backoff: BackoffConfig,
}

impl Default for PassiveConfig {
    fn default() -> Self {
        Self {
            delay_ms: 1000,
            limit: None,
            shodan_url: SHODAN_BASE_URL.to_string(),
            censys_url: CENSYS_BASE_URL.to_string(),
            timeout_secs: 30,
            backoff: BackoffPolicy::passive().into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub backoff: BackoffConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        let chat = ChatSettings::default();
        Self {
            base_url: OPENAI_BASE_URL.to_string(),
            model: chat.model,
            temperature: chat.temperature,
            max_tokens: chat.max_tokens,
            timeout_secs: chat.timeout.as_secs(),
            backoff: BackoffPolicy::classification().into(),
        }
    }
}

impl LlmConfig {
    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Effective run configuration: built-in defaults, then the config file,
/// then command-line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    pub db_dir: PathBuf,
    pub concurrency: usize,
    /// Multiple of a tool's timeout after which it is killed even while still
    /// writing. Zero disables the ceiling.
    pub hard_limit_factor: u32,
    pub enum_tools: Vec<String>,
    pub tools: BTreeMap<String, ToolSpec>,
    pub passive: PassiveConfig,
    pub llm: LlmConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            db_dir: PathBuf::from("db"),
            concurrency: DEFAULT_CONCURRENCY,
            hard_limit_factor: DEFAULT_HARD_LIMIT_FACTOR,
            enum_tools: ENUM_TOOLS.iter().map(|s| s.to_string()).collect(),
            tools: default_tools(),
            passive: PassiveConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

/// On-disk form. Every field is optional and overrides the default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    output_dir: Option<PathBuf>,
    db_dir: Option<PathBuf>,
    concurrency: Option<usize>,
    hard_limit_factor: Option<u32>,
    enum_tools: Option<Vec<String>>,
    tools: Option<BTreeMap<String, ToolOverride>>,
    passive: Option<PassiveOverride>,
    llm: Option<LlmOverride>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ToolOverride {
    command: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BackoffOverride {
    initial_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PassiveOverride {
    delay_ms: Option<u64>,
    limit: Option<usize>,
    shodan_url: Option<String>,
    censys_url: Option<String>,
    timeout_secs: Option<u64>,
    backoff: Option<BackoffOverride>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LlmOverride {
    base_url: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    timeout_secs: Option<u64>,
    backoff: Option<BackoffOverride>,
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *target = v;
    }
}

fn apply_backoff(target: &mut BackoffConfig, o: BackoffOverride) {
    set(&mut target.initial_ms, o.initial_ms);
    set(&mut target.max_delay_ms, o.max_delay_ms);
    set(&mut target.max_attempts, o.max_attempts);
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, PipelineError> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))?;
        let mut cfg = Self::default();
        cfg.apply(file);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let meta = fs::metadata(path).map_err(|e| PipelineError::io(path, e))?;
        if meta.len() > MAX_CONFIG_BYTES {
            return Err(PipelineError::Config(format!(
                "config {} exceeds {} bytes",
                path.display(),
                MAX_CONFIG_BYTES
            )));
        }
        let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    fn apply(&mut self, file: ConfigFile) {
        set(&mut self.output_dir, file.output_dir);
        set(&mut self.db_dir, file.db_dir);
        set(&mut self.concurrency, file.concurrency);
        set(&mut self.hard_limit_factor, file.hard_limit_factor);
        set(&mut self.enum_tools, file.enum_tools);

        for (name, o) in file.tools.unwrap_or_default() {
            match self.tools.get_mut(&name) {
                Some(spec) => {
                    set(&mut spec.command, o.command);
                    set(&mut spec.timeout_secs, o.timeout_secs);
                }
                None => {
                    // custom tools need a command; the timeout falls back to 120s
                    if let Some(command) = o.command {
                        self.tools.insert(
                            name,
                            ToolSpec {
                                command,
                                timeout_secs: o.timeout_secs.unwrap_or(120),
                            },
                        );
                    }
                }
            }
        }

        if let Some(p) = file.passive {
            let target = &mut self.passive;
            set(&mut target.delay_ms, p.delay_ms);
            if p.limit.is_some() {
                target.limit = p.limit;
            }
            set(&mut target.shodan_url, p.shodan_url);
            set(&mut target.censys_url, p.censys_url);
            set(&mut target.timeout_secs, p.timeout_secs);
            if let Some(b) = p.backoff {
                apply_backoff(&mut target.backoff, b);
            }
        }

        if let Some(l) = file.llm {
            let target = &mut self.llm;
            set(&mut target.base_url, l.base_url);
            set(&mut target.model, l.model);
            set(&mut target.temperature, l.temperature);
            set(&mut target.max_tokens, l.max_tokens);
            set(&mut target.timeout_secs, l.timeout_secs);
            if let Some(b) = l.backoff {
                apply_backoff(&mut target.backoff, b);
            }
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.concurrency == 0 {
            return Err(PipelineError::Config("concurrency must be at least 1".into()));
        }
        for (name, spec) in &self.tools {
            if spec.command.trim().is_empty() {
                return Err(PipelineError::Config(format!("tool {name} has an empty command")));
            }
            if spec.timeout_secs == 0 {
                return Err(PipelineError::Config(format!("tool {name} has a zero timeout")));
            }
        }
        Ok(())
    }

    pub fn tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    /// `<db_dir>/<domain>.db`
    pub fn db_path(&self, domain: &str) -> PathBuf {
        self.db_dir.join(format!("{domain}.db"))
    }
}
