//! Builders for test data.

#![allow(dead_code)]

use std::collections::BTreeMap;

use surfwatch::db::target_repo::TargetRow;
use surfwatch::tool::OutputFormat;
use surfwatch::{ScanSchedule, ToolDefinition, ToolInvocation};

/// Builder for `TargetRow` values.
pub struct TargetBuilder {
    row: TargetRow,
}

impl TargetBuilder {
    pub fn new(id: &str, value: &str) -> Self {
        Self {
            row: TargetRow {
                id: id.to_string(),
                value: value.to_string(),
                last_discovered_at: None,
                is_rescan: false,
                scan_schedule: ScanSchedule::Disabled.as_str().to_string(),
                rescan_started_at: None,
                created_at: "2026-01-01T00:00:00.000000Z".to_string(),
            },
        }
    }

    pub fn schedule(mut self, schedule: ScanSchedule) -> Self {
        self.row.scan_schedule = schedule.as_str().to_string();
        self
    }

    pub fn last_discovered_at(mut self, timestamp: &str) -> Self {
        self.row.last_discovered_at = Some(timestamp.to_string());
        self
    }

    pub fn build(self) -> TargetRow {
        self.row
    }
}

/// Builder for `ToolDefinition` values.
pub struct ToolBuilder {
    def: ToolDefinition,
}

impl ToolBuilder {
    pub fn new(id: &str, command: &str) -> Self {
        Self {
            def: ToolDefinition {
                id: id.to_string(),
                name: id.to_string(),
                command: command.to_string(),
                args: Vec::new(),
                output: OutputFormat::Raw,
                timeout_seconds: 30,
                accepted_exit_codes: vec![0],
            },
        }
    }

    pub fn arg(mut self, name: &str) -> Self {
        self.def.args.push(name.to_string());
        self
    }

    pub fn output(mut self, output: OutputFormat) -> Self {
        self.def.output = output;
        self
    }

    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.def.timeout_seconds = seconds;
        self
    }

    pub fn build(self) -> ToolDefinition {
        self.def
    }
}

pub fn invocation(tool_id: &str, target_ids: &[&str], args: &[(&str, &str)]) -> ToolInvocation {
    ToolInvocation {
        tool_id: tool_id.to_string(),
        args: args
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        target_ids: target_ids.iter().map(|s| s.to_string()).collect(),
        asset_ids: Vec::new(),
    }
}

/// Minimal valid config JSON with the given tools section.
pub fn config_json(tools_json: &str, rescan_tools: &[&str]) -> String {
    let rescan: Vec<String> = rescan_tools.iter().map(|t| format!("\"{}\"", t)).collect();
    format!(
        r#"{{
            "version": "1.0",
            "scheduler": {{ "tick_seconds": 3600, "rescan_tools": [{}] }},
            "queues": {{
                "tools": {{ "concurrency": 2, "max_attempts": 2, "backoff_base_ms": 10, "backoff_cap_ms": 50, "poll_interval_ms": 50 }},
                "issues": {{ "poll_interval_ms": 50 }},
                "rescans": {{ "concurrency": 1, "poll_interval_ms": 50 }}
            }},
            "tools": {}
        }}"#,
        rescan.join(", "),
        tools_json
    )
}
