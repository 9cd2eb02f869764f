use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Row id of an asset in the store.
pub type AssetId = i64;

/// Category an asset is classified into.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    #[serde(rename = "Admin Portal")]
    AdminPortal,
    #[serde(rename = "API Server")]
    ApiServer,
    #[serde(rename = "Authentication/Login")]
    Authentication,
    #[serde(rename = "Development/Testing Environment")]
    Development,
    #[serde(rename = "Monitoring/Status")]
    Monitoring,
    #[serde(rename = "Storage/Bucket")]
    Storage,
    #[serde(rename = "Public Website")]
    PublicWebsite,
    Unknown,
}

impl Purpose {
    pub const ALL: [Purpose; 8] = [
        Purpose::AdminPortal,
        Purpose::ApiServer,
        Purpose::Authentication,
        Purpose::Development,
        Purpose::Monitoring,
        Purpose::Storage,
        Purpose::PublicWebsite,
        Purpose::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdminPortal => "Admin Portal",
            Self::ApiServer => "API Server",
            Self::Authentication => "Authentication/Login",
            Self::Development => "Development/Testing Environment",
            Self::Monitoring => "Monitoring/Status",
            Self::Storage => "Storage/Bucket",
            Self::PublicWebsite => "Public Website",
            Self::Unknown => "Unknown",
        }
    }

    /// Lenient mapping from model output. Unrecognised text becomes `Unknown`.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(label))
            .unwrap_or(Self::Unknown)
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity reported by a vulnerability template.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
    #[default]
    Unknown,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for Severity {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "info" => Self::Info,
            "low" => Self::Low,
            "medium" => Self::Medium,
            "high" => Self::High,
            "critical" => Self::Critical,
            _ => Self::Unknown,
        })
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host name under the scanned domain.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub id: AssetId,
    pub name: String,
    pub purpose: Option<Purpose>,
}

/// Fields written by a classification result.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassificationUpdate {
    pub backend: String,
    /// `None` leaves `Asset::purpose` untouched.
    pub purpose: Option<Purpose>,
    pub vulnerabilities_summary: String,
    pub exploration_summary: String,
}

/// One open (or otherwise reported) port on an asset.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortFinding {
    pub port: u16,
    pub protocol: String,
    pub service: String,
    pub version: String,
    pub state: String,
}

impl PortFinding {
    /// A port known only to be open, as reported by passive providers.
    pub fn open_tcp(port: u16) -> Self {
        Self {
            port,
            protocol: "tcp".into(),
            service: String::new(),
            version: String::new(),
            state: "open".into(),
        }
    }
}

/// One detection event from a vulnerability scanner.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VulnerabilityFinding {
    pub template_id: String,
    pub severity: Severity,
    pub matcher: String,
    pub matched_at: String,
    pub kind: String,
}

/// Current classification of an asset.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClassificationRecord {
    pub asset: String,
    pub backend: String,
    pub purpose: Option<Purpose>,
    pub vulnerabilities_summary: String,
    pub exploration_summary: String,
    pub created_at: String,
}

/// Current red-team advice for an asset.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExploitAdvice {
    pub asset: String,
    pub advice_text: String,
    pub risk_score: f64,
    pub created_at: String,
}

/// Stored findings for one asset, used to build advisory prompts.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AssetContext {
    pub asset: String,
    pub ports: Vec<PortFinding>,
    pub vulnerabilities: Vec<VulnerabilityFinding>,
    pub tech_stack: Vec<String>,
}

/// One row of the joined per-asset export.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AssetSummary {
    pub subdomain: String,
    pub purpose: Option<String>,
    pub ports: String,
    pub vulnerabilities: String,
    pub backend: String,
    pub risk_score: Option<f64>,
    pub advice: String,
}

/// Clamp a model-reported risk score into `[0, 10]`. Non-finite values become 0.
pub fn clamp_risk_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 10.0)
    } else {
        0.0
    }
}
