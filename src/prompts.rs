use crate::llm::Prompt;
use crate::types::{AssetContext, Purpose};

pub const SYSTEM_PROMPT: &str = "You are a red team security expert.";

/// Fingerprinting prompt for one asset. Asks for a strict JSON object.
pub fn classification_prompt(asset: &str) -> Prompt {
    let categories = Purpose::ALL
        .iter()
        .map(|p| format!("  - {p}"))
        .collect::<Vec<_>>()
        .join("\n");
    let user = format!(
        r#"You are analyzing an external subdomain to determine its risk and purpose.

Subdomain name: {asset}

Tasks:
- Based on the subdomain name, accessing and exploring the website (HTTP response headers, sitemap.xml, robots.txt, client-side JavaScript and fingerprints), predict what this subdomain is used for.
- Classify the subdomain's purpose into one of:
{categories}
- Also guess the backend stack if possible.
- Identify common vulnerabilities likely for this type of asset.
- Suggest direct attack advice based on what you see.

Respond in STRICT JSON format:
{{
  "backend": "Likely backend stack",
  "vulnerabilities": "Short list or paragraph",
  "risk_score": 0,
  "direct_attack_advice": "One or two technical exploitation suggestions",
  "manual_website_exploring_result": "Summary of manual exploration tips",
  "purpose": "Selected category from the list"
}}"#
    );
    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

/// Exploitation-advice prompt built from an asset's stored findings.
pub fn advisory_prompt(context: &AssetContext) -> Prompt {
    let ports = if context.ports.is_empty() {
        "N/A".to_string()
    } else {
        context
            .ports
            .iter()
            .map(|p| format!("{}/{}/{}", p.port, p.service, p.state))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let tech_stack = if context.tech_stack.is_empty() {
        "Unknown".to_string()
    } else {
        context.tech_stack.join(", ")
    };
    let findings = if context.vulnerabilities.is_empty() {
        "None".to_string()
    } else {
        context
            .vulnerabilities
            .iter()
            .map(|v| format!("- Template: {} ({}) at {}", v.template_id, capitalize(v.severity.as_str()), v.matched_at))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let user = format!(
        "You are a red team expert.

Subdomain: {asset}
Open Ports/Services: {ports}
Tech Stack: {tech_stack}

Findings from Nuclei:
{findings}

Based on this information, provide realistic exploitation strategies.
Include tactics, tools, and possible attack chains.
Give professional, actionable insights.
At the end, include a 'Risk Score: X.Y' which will be used as indication if the subdomain might be exploited from 0 to 10.",
        asset = context.asset,
    );
    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PortFinding, Severity, VulnerabilityFinding};

    #[test]
    fn classification_prompt_lists_categories() {
        let p = classification_prompt("api.example.com");
        assert!(p.user.contains("Subdomain name: api.example.com"));
        assert!(p.user.contains("  - Storage/Bucket"));
        assert!(p.user.contains("\"manual_website_exploring_result\""));
    }

    #[test]
    fn advisory_prompt_without_findings() {
        let ctx = AssetContext {
            asset: "a.example.com".into(),
            ..Default::default()
        };
        let p = advisory_prompt(&ctx);
        assert!(p.user.contains("Open Ports/Services: N/A"));
        assert!(p.user.contains("Findings from Nuclei:\nNone"));
    }

    #[test]
    fn advisory_prompt_renders_findings() {
        let ctx = AssetContext {
            asset: "a.example.com".into(),
            ports: vec![PortFinding {
                port: 22,
                protocol: "tcp".into(),
                service: "ssh".into(),
                version: String::new(),
                state: "open".into(),
            }],
            vulnerabilities: vec![VulnerabilityFinding {
                template_id: "git-config".into(),
                severity: Severity::Medium,
                matcher: String::new(),
                matched_at: "https://a.example.com/.git/config".into(),
                kind: "http".into(),
            }],
            tech_stack: vec![],
        };
        let p = advisory_prompt(&ctx);
        assert!(p.user.contains("Open Ports/Services: 22/ssh/open"));
        assert!(p.user.contains("- Template: git-config (Medium) at https://a.example.com/.git/config"));
    }
}
