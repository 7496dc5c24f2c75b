//! External security tools: templates, binding, execution and output
//! parsing.

pub mod binder;
pub mod catalog;
pub mod parser;
pub mod process;

pub use binder::{bind, check_value, placeholders, validate_binding};
pub use catalog::{ToolCatalog, ToolDefinition, BUILTIN_BINDINGS};
pub use parser::{Finding, OutputFormat, ToolFindings};
pub use process::{ProcessOutput, ProcessRunner, DEFAULT_SHELL};
