//! Turns tool stdout into findings according to the tool's output format.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a tool reports its results on stdout.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Opaque text, stored on the job result only.
    #[default]
    Raw,
    /// One discovered host per line.
    Lines,
    /// One JSON object per line.
    JsonLines,
}

/// A single observation: a host and, optionally, a vulnerability on it.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Finding {
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Finding {
    fn host(host: &str) -> Self {
        Self {
            host: host.to_string(),
            name: None,
            severity: None,
            detail: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolFindings {
    pub findings: Vec<Finding>,
    /// Lines that could not be understood.
    pub skipped: usize,
    /// Stdout for `raw` tools, truncated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

const MAX_RAW_CHARS: usize = 65_536;

pub fn parse(format: OutputFormat, stdout: &str) -> ToolFindings {
    match format {
        OutputFormat::Raw => ToolFindings {
            raw: Some(crate::sanitize::truncate(stdout, MAX_RAW_CHARS)),
            ..Default::default()
        },
        OutputFormat::Lines => {
            let mut findings: Vec<Finding> = Vec::new();
            let mut seen: HashSet<String> = HashSet::new();
            for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
                let host = normalize_host(line);
                if !host.is_empty() && !seen.contains(&host) {
                    findings.push(Finding::host(&host));
                    seen.insert(host);
                }
            }
            ToolFindings {
                findings,
                ..Default::default()
            }
        }
        OutputFormat::JsonLines => {
            let mut out = ToolFindings::default();
            for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
                match serde_json::from_str::<Value>(line)
                    .ok()
                    .as_ref()
                    .and_then(finding_from_json)
                {
                    Some(finding) => out.findings.push(finding),
                    None => {
                        log::debug!(
                            "Skipping unparseable tool line: {}",
                            crate::sanitize::truncate(line, 120)
                        );
                        out.skipped += 1;
                    }
                }
            }
            out
        }
    }
}

fn first_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| value.get(*k).and_then(Value::as_str))
        .find(|s| !s.trim().is_empty())
}

fn finding_from_json(value: &Value) -> Option<Finding> {
    let host = normalize_host(first_str(value, &["host", "domain", "ip", "url"])?);
    if host.is_empty() {
        return None;
    }
    let severity = first_str(value, &["severity"])
        .or_else(|| value.pointer("/info/severity").and_then(Value::as_str))
        .map(|s| s.to_ascii_lowercase());
    Some(Finding {
        host,
        name: first_str(value, &["name", "template_id", "template-id", "vulnerability"])
            .map(str::to_string),
        severity,
        detail: first_str(value, &["detail", "description", "matched_at", "matched-at"])
            .map(str::to_string),
    })
}

/// Reduces a URL or `host:port` to a lowercase host name.
pub fn normalize_host(raw: &str) -> String {
    let mut host = raw.trim();
    if let Some(idx) = host.find("://") {
        host = &host[idx + 3..];
    }
    if let Some(idx) = host.find(['/', '?', '#']) {
        host = &host[..idx];
    }
    if let Some(idx) = host.rfind('@') {
        host = &host[idx + 1..];
    }
    // Strip a port, but leave bare IPv6 addresses alone.
    if host.matches(':').count() == 1 {
        if let Some((name, _port)) = host.split_once(':') {
            host = name;
        }
    }
    host.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_keeps_stdout() {
        let parsed = parse(OutputFormat::Raw, "anything at all");
        assert!(parsed.findings.is_empty());
        assert_eq!(parsed.raw.as_deref(), Some("anything at all"));
    }

    #[test]
    fn test_lines_dedupes_hosts() {
        let parsed = parse(
            OutputFormat::Lines,
            "api.example.com\n\n  WWW.example.com \napi.example.com\n",
        );
        let hosts: Vec<&str> = parsed.findings.iter().map(|f| f.host.as_str()).collect();
        assert_eq!(hosts, vec!["api.example.com", "www.example.com"]);
    }

    #[test]
    fn test_lines_handles_large_enumerations() {
        let mut stdout: String = (0..50_000).map(|i| format!("h{}.example.com\n", i)).collect();
        stdout.push_str("h7.example.com\nH7.EXAMPLE.COM\n");

        let start = std::time::Instant::now();
        let parsed = parse(OutputFormat::Lines, &stdout);
        assert!(start.elapsed() < std::time::Duration::from_secs(5));

        assert_eq!(parsed.findings.len(), 50_000);
        assert_eq!(parsed.findings[0].host, "h0.example.com");
        assert_eq!(parsed.findings[49_999].host, "h49999.example.com");
    }

    #[test]
    fn test_json_lines() {
        let stdout = concat!(
            r#"{"host":"https://app.example.com:8443/login","template_id":"exposed-panel","info":{"severity":"HIGH"}}"#,
            "\n",
            "not json\n",
            r#"{"ip":"10.0.0.5"}"#,
            "\n",
            r#"{"nothing":"useful"}"#,
            "\n"
        );
        let parsed = parse(OutputFormat::JsonLines, stdout);
        assert_eq!(parsed.skipped, 2);
        assert_eq!(parsed.findings.len(), 2);
        assert_eq!(parsed.findings[0].host, "app.example.com");
        assert_eq!(parsed.findings[0].name.as_deref(), Some("exposed-panel"));
        assert_eq!(parsed.findings[0].severity.as_deref(), Some("high"));
        assert_eq!(parsed.findings[1].host, "10.0.0.5");
        assert!(parsed.findings[1].name.is_none());
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("http://user@Example.com:80/x?y"), "example.com");
        assert_eq!(normalize_host("example.com."), "example.com");
        assert_eq!(normalize_host("10.0.0.1:22"), "10.0.0.1");
        assert_eq!(normalize_host("::1"), "::1");
    }
}
