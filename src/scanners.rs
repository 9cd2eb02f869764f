//! Parsers for deep-scan tool output.

use serde::Deserialize;
use tracing::warn;

use crate::types::{PortFinding, Severity, VulnerabilityFinding};

#[derive(Deserialize)]
struct NucleiEvent {
    #[serde(rename = "template-id")]
    template_id: String,
    #[serde(default)]
    info: NucleiInfo,
    #[serde(rename = "matcher-name", default)]
    matcher_name: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(rename = "matched-at", default)]
    matched_at: Option<String>,
    #[serde(default)]
    host: Option<String>,
}

#[derive(Deserialize, Default)]
struct NucleiInfo {
    #[serde(default)]
    severity: Option<String>,
}

/// Parse one nuclei JSON line.
pub fn parse_nuclei_line(line: &str) -> Result<VulnerabilityFinding, serde_json::Error> {
    let event: NucleiEvent = serde_json::from_str(line)?;
    let severity = event
        .info
        .severity
        .as_deref()
        .map(|s| s.parse().unwrap_or_default())
        .unwrap_or(Severity::Unknown);
    Ok(VulnerabilityFinding {
        template_id: event.template_id,
        severity,
        matcher: event.matcher_name.unwrap_or_default(),
        matched_at: event.matched_at.or(event.host).unwrap_or_default(),
        kind: event.kind.unwrap_or_default(),
    })
}

/// Parse nuclei JSON-lines output. Malformed lines are logged and skipped.
pub fn parse_nuclei_output(asset: &str, output: &str) -> Vec<VulnerabilityFinding> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| match parse_nuclei_line(line) {
            Ok(finding) => Some(finding),
            Err(e) => {
                warn!(asset, error = %e, "skipping malformed nuclei line");
                None
            }
        })
        .collect()
}

/// Parse nmap grepable output (`-oG -`) into port findings.
///
/// Only `Host:` lines carrying a `Ports:` field contribute. Each entry has the
/// shape `port/state/protocol/owner/service/rpc/version/`.
pub fn parse_nmap_grepable(output: &str) -> Vec<PortFinding> {
    let mut findings = Vec::new();
    for line in output.lines().filter(|l| l.starts_with("Host:")) {
        let Some(start) = line.find("Ports:") else {
            continue;
        };
        let ports = &line[start + "Ports:".len()..];
        let ports = ports.split('\t').next().unwrap_or_default();
        for entry in ports.split(", ").map(str::trim).filter(|e| !e.is_empty()) {
            if let Some(finding) = parse_nmap_entry(entry) {
                findings.push(finding);
            }
        }
    }
    findings
}

fn parse_nmap_entry(entry: &str) -> Option<PortFinding> {
    let fields: Vec<&str> = entry.splitn(7, '/').collect();
    let port = fields.first()?.trim().parse::<u16>().ok()?;
    let field = |i: usize| fields.get(i).map(|s| s.trim()).unwrap_or_default();
    Some(PortFinding {
        port,
        state: field(1).to_string(),
        protocol: field(2).to_string(),
        service: field(4).to_string(),
        version: field(6).trim_end_matches('/').trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nuclei_line_fields() {
        let line = r#"{"template-id":"git-config","info":{"name":"Git Config","severity":"medium"},"type":"http","host":"https://a.example.com","matched-at":"https://a.example.com/.git/config","matcher-name":"status"}"#;
        let f = parse_nuclei_line(line).unwrap();
        assert_eq!(f.template_id, "git-config");
        assert_eq!(f.severity, Severity::Medium);
        assert_eq!(f.matcher, "status");
        assert_eq!(f.kind, "http");
        assert_eq!(f.matched_at, "https://a.example.com/.git/config");
    }

    #[test]
    fn nuclei_unknown_severity_and_missing_fields() {
        let f = parse_nuclei_line(r#"{"template-id":"x","info":{"severity":"bogus"}}"#).unwrap();
        assert_eq!(f.severity, Severity::Unknown);
        assert!(f.matcher.is_empty() && f.matched_at.is_empty());
    }

    #[test]
    fn nuclei_output_skips_garbage() {
        let out = "{\"template-id\":\"a\",\"info\":{\"severity\":\"low\"}}\nnot json\n\n{\"template-id\":\"b\"}\n";
        let findings = parse_nuclei_output("a.example.com", out);
        let ids: Vec<_> = findings.iter().map(|f| f.template_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn nmap_grepable_ports() {
        let out = "# Nmap 7.94 scan initiated\n\
Host: 93.184.216.34 (a.example.com)\tStatus: Up\n\
Host: 93.184.216.34 (a.example.com)\tPorts: 22/open/tcp//ssh//OpenSSH 8.9p1 Ubuntu/, 80/open/tcp//http//nginx 1.18.0/, 443/filtered/tcp//https///\tIgnored State: closed (997)\n\
# Nmap done";
        let ports = parse_nmap_grepable(out);
        assert_eq!(ports.len(), 3);
        assert_eq!(ports[0].port, 22);
        assert_eq!(ports[0].service, "ssh");
        assert_eq!(ports[0].version, "OpenSSH 8.9p1 Ubuntu");
        assert_eq!(ports[1].protocol, "tcp");
        assert_eq!(ports[2].state, "filtered");
        assert!(ports[2].version.is_empty());
    }

    #[test]
    fn nmap_without_ports_is_empty() {
        assert!(parse_nmap_grepable("Host: 1.2.3.4 ()\tStatus: Down\n").is_empty());
    }
}
