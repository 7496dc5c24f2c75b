//! Tool catalog: the configured command templates workers may run.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::binder;
use super::parser::OutputFormat;
use crate::error::ConfigError;

/// Bindings every tool run provides in addition to its declared args.
pub const BUILTIN_BINDINGS: &[&str] = &["targets", "target_ids", "asset_ids"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: String,
    pub name: String,
    /// Command template with `{{placeholder}}` slots.
    pub command: String,
    /// Names of user-supplied arguments the template may reference.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub output: OutputFormat,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_accepted_exit_codes")]
    pub accepted_exit_codes: Vec<i32>,
}

fn default_timeout_seconds() -> u64 {
    600
}

fn default_accepted_exit_codes() -> Vec<i32> {
    vec![0]
}

impl ToolDefinition {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn accepts_exit_code(&self, code: i32) -> bool {
        self.accepted_exit_codes.contains(&code)
    }

    /// Checks the definition is usable on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidTool {
            id: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty".to_string()));
        }
        if self.command.trim().is_empty() {
            return Err(invalid("command must not be empty".to_string()));
        }
        if self.timeout_seconds == 0 {
            return Err(invalid("timeout_seconds must be positive".to_string()));
        }
        if self.accepted_exit_codes.is_empty() {
            return Err(invalid("accepted_exit_codes must not be empty".to_string()));
        }
        for name in binder::placeholders(&self.command) {
            if !self.args.contains(&name) && !BUILTIN_BINDINGS.contains(&name.as_str()) {
                return Err(invalid(format!(
                    "template references undeclared argument '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Verifies user-supplied args against the declaration.
    pub fn check_args(&self, args: &BTreeMap<String, String>) -> Result<(), ConfigError> {
        for name in args.keys() {
            if !self.args.contains(name) {
                return Err(ConfigError::InvalidTool {
                    id: self.id.clone(),
                    reason: format!("unknown argument '{}'", name),
                });
            }
        }
        Ok(())
    }
}

/// Lookup table of tool definitions by ID.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: HashMap<String, ToolDefinition>,
}

impl ToolCatalog {
    /// Builds a catalog, rejecting invalid or duplicate definitions.
    pub fn new(definitions: Vec<ToolDefinition>) -> Result<Self, ConfigError> {
        let mut tools = HashMap::with_capacity(definitions.len());
        for def in definitions {
            def.validate()?;
            if tools.contains_key(&def.id) {
                return Err(ConfigError::InvalidTool {
                    id: def.id.clone(),
                    reason: "Duplicate tool ID".to_string(),
                });
            }
            tools.insert(def.id.clone(), def);
        }
        Ok(Self { tools })
    }

    pub fn get(&self, id: &str) -> Result<&ToolDefinition, ConfigError> {
        self.tools
            .get(id)
            .ok_or_else(|| ConfigError::UnknownTool(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tools.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
