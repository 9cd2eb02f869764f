//! Passive port lookups against Shodan or Censys.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::client::{check_status, transport_error, Credential, Provider, RateLimitedClient};
use crate::error::{CallError, PipelineError};
use crate::store::AssetStore;
use crate::types::PortFinding;

pub const SHODAN_BASE_URL: &str = "https://api.shodan.io";
pub const CENSYS_BASE_URL: &str = "https://search.censys.io";

/// Which passive provider to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassiveSource {
    Shodan,
    Censys,
}

impl PassiveSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shodan => "shodan",
            Self::Censys => "censys",
        }
    }
}

impl FromStr for PassiveSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shodan" => Ok(Self::Shodan),
            "censys" => Ok(Self::Censys),
            other => Err(format!("unknown passive source '{other}' (expected shodan or censys)")),
        }
    }
}

pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct ShodanHost {
    #[serde(default)]
    ports: Vec<u16>,
}

/// `GET /shodan/host/{ip}?key=…`
#[derive(Debug, Clone)]
pub struct ShodanProvider {
    http: reqwest::Client,
    base_url: String,
}

impl ShodanProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: http_client(Duration::from_secs(30)),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http = http_client(timeout);
        self
    }
}

#[async_trait]
impl Provider for ShodanProvider {
    type Request = IpAddr;
    type Response = Vec<u16>;

    fn name(&self) -> &str {
        "shodan"
    }

    async fn send(&self, credential: &Credential, ip: &IpAddr) -> Result<Vec<u16>, CallError> {
        let Credential::ApiKey(key) = credential else {
            return Err(CallError::Provider("shodan needs an API key".into()));
        };
        let url = format!("{}/shodan/host/{ip}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("key", key.as_str())])
            .send()
            .await
            .map_err(transport_error)?;
        check_status(resp.status())?;
        let host: ShodanHost = resp
            .json()
            .await
            .map_err(|e| CallError::Malformed(e.to_string()))?;
        Ok(normalize_ports(host.ports))
    }
}

#[derive(Debug, Deserialize)]
struct CensysEnvelope {
    #[serde(default)]
    result: CensysHost,
}

#[derive(Debug, Default, Deserialize)]
struct CensysHost {
    #[serde(default)]
    services: Vec<CensysService>,
}

#[derive(Debug, Deserialize)]
struct CensysService {
    port: Option<u16>,
}

/// `GET /api/v2/hosts/{ip}` with Basic id:secret.
#[derive(Debug, Clone)]
pub struct CensysProvider {
    http: reqwest::Client,
    base_url: String,
}

impl CensysProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: http_client(Duration::from_secs(30)),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http = http_client(timeout);
        self
    }
}

#[async_trait]
impl Provider for CensysProvider {
    type Request = IpAddr;
    type Response = Vec<u16>;

    fn name(&self) -> &str {
        "censys"
    }

    async fn send(&self, credential: &Credential, ip: &IpAddr) -> Result<Vec<u16>, CallError> {
        let Credential::Basic { id, secret } = credential else {
            return Err(CallError::Provider("censys needs an id/secret pair".into()));
        };
        let url = format!("{}/api/v2/hosts/{ip}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .basic_auth(id, Some(secret))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport_error)?;
        check_status(resp.status())?;
        let body: CensysEnvelope = resp
            .json()
            .await
            .map_err(|e| CallError::Malformed(e.to_string()))?;
        Ok(normalize_ports(
            body.result.services.into_iter().filter_map(|s| s.port).collect(),
        ))
    }
}

/// Runtime choice between the two providers.
#[derive(Debug, Clone)]
pub enum PortLookup {
    Shodan(ShodanProvider),
    Censys(CensysProvider),
}

#[async_trait]
impl Provider for PortLookup {
    type Request = IpAddr;
    type Response = Vec<u16>;

    fn name(&self) -> &str {
        match self {
            Self::Shodan(p) => p.name(),
            Self::Censys(p) => p.name(),
        }
    }

    async fn send(&self, credential: &Credential, ip: &IpAddr) -> Result<Vec<u16>, CallError> {
        match self {
            Self::Shodan(p) => p.send(credential, ip).await,
            Self::Censys(p) => p.send(credential, ip).await,
        }
    }
}

fn normalize_ports(mut ports: Vec<u16>) -> Vec<u16> {
    ports.retain(|p| *p != 0);
    ports.sort_unstable();
    ports.dedup();
    ports
}

/// Resolve hosts to one address each, grouping hosts that share an address.
/// Unresolvable hosts are logged and left out.
pub async fn resolve_hosts(hosts: &[String]) -> BTreeMap<IpAddr, Vec<String>> {
    let mut map: BTreeMap<IpAddr, Vec<String>> = BTreeMap::new();
    for host in hosts {
        match tokio::net::lookup_host((host.as_str(), 0)).await {
            Ok(addrs) => {
                let addrs: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                let chosen = addrs.iter().find(|ip| ip.is_ipv4()).or(addrs.first());
                match chosen {
                    Some(ip) => map.entry(*ip).or_default().push(host.clone()),
                    None => warn!(host = %host, "no addresses for host"),
                }
            }
            Err(e) => warn!(host = %host, error = %e, "failed to resolve host"),
        }
    }
    map
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassiveScanReport {
    pub ips_queried: usize,
    pub failures: usize,
    pub ports_saved: usize,
    pub csv_path: PathBuf,
}

/// Look up every address, dump `host,ip,ports` rows to `csv_path` and store
/// the open ports of each host.
///
/// Failed lookups are logged and written with an empty port list; they never
/// stop the remaining addresses.
pub async fn run_passive_scan<P>(
    client: &RateLimitedClient<P>,
    targets: &BTreeMap<IpAddr, Vec<String>>,
    limit: Option<usize>,
    csv_path: &Path,
    store: &AssetStore,
) -> Result<PassiveScanReport, PipelineError>
where
    P: Provider<Request = IpAddr, Response = Vec<u16>>,
{
    let provider = client.provider().name().to_string();
    info!(provider = %provider, ips = targets.len(), "running passive port scan");

    let file = File::create(csv_path).map_err(|e| PipelineError::io(csv_path, e))?;
    let mut csv = BufWriter::new(file);
    write_row(&mut csv, csv_path, "host", "ip", "ports")?;

    let mut report = PassiveScanReport {
        ips_queried: 0,
        failures: 0,
        ports_saved: 0,
        csv_path: csv_path.to_path_buf(),
    };

    for (ip, hosts) in targets.iter().take(limit.unwrap_or(usize::MAX)) {
        report.ips_queried += 1;
        let ports = match client.call(ip).await {
            Ok(ports) => ports,
            Err(e) => {
                warn!(provider = %provider, ip = %ip, error = %e, "passive lookup failed");
                report.failures += 1;
                Vec::new()
            }
        };
        let joined = ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(";");
        for host in hosts {
            write_row(&mut csv, csv_path, host, &ip.to_string(), &joined)?;
            if ports.is_empty() {
                continue;
            }
            let findings: Vec<PortFinding> = ports.iter().copied().map(PortFinding::open_tcp).collect();
            match store.append_port_findings(host, &findings) {
                Ok(n) => report.ports_saved += n,
                Err(e) => warn!(host = %host, error = %e, "failed to save passive ports"),
            }
        }
    }

    info!(
        provider = %provider,
        saved = report.ports_saved,
        failures = report.failures,
        path = %csv_path.display(),
        "passive scan finished"
    );
    Ok(report)
}

fn write_row(
    csv: &mut BufWriter<File>,
    path: &Path,
    host: &str,
    ip: &str,
    ports: &str,
) -> Result<(), PipelineError> {
    writeln!(csv, "{host},{ip},{ports}")
        .and_then(|_| csv.flush())
        .map_err(|e| PipelineError::io(path, e))
}
