use std::path::Path;

use crate::config::schema::{Config, QUEUE_NAMES};
use crate::error::ConfigError;
use crate::tool::ToolCatalog;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| format!("{} at {}", e, e.instance_path()))
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    // Unique ids and well-formed templates.
    let catalog = ToolCatalog::new(config.tools.clone())?;

    for tool_id in &config.scheduler.rescan_tools {
        if !catalog.contains(tool_id) {
            return Err(ConfigError::UnknownTool(tool_id.clone()));
        }
    }

    if config.scheduler.rescan_tools.is_empty() {
        log::warn!("No rescan_tools configured; scheduled rescans will not run any tool");
    }

    for (name, queue) in &config.queues {
        if !QUEUE_NAMES.contains(&name.as_str()) {
            return Err(ConfigError::UnknownQueue(name.clone()));
        }
        if queue.concurrency == Some(0) {
            return Err(ConfigError::Validation {
                message: format!("Queue '{}' must have positive concurrency", name),
            });
        }
        if queue.max_attempts == 0 {
            return Err(ConfigError::Validation {
                message: format!("Queue '{}' must allow at least one attempt", name),
            });
        }
        if queue.backoff_base_ms > queue.backoff_cap_ms {
            return Err(ConfigError::Validation {
                message: format!(
                    "Queue '{}' backoff_base_ms exceeds backoff_cap_ms",
                    name
                ),
            });
        }
    }

    Ok(())
}
