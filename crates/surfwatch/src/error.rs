use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::tool::process::ProcessOutput;

#[derive(Error, Debug)]
pub enum SurfwatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    #[error("Invalid tool '{id}': {reason}")]
    InvalidTool { id: String, reason: String },

    #[error("Command template is missing bindings for: {}", .names.join(", "))]
    MissingBinding { names: Vec<String> },

    #[error("Value for '{name}' would be read as an option: {value}")]
    OptionLikeValue { name: String, value: String },

    #[error("Unknown queue '{0}'")]
    UnknownQueue(String),
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn '{shell}': {source}")]
    SpawnFailed {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Command exited with code {code}: {}", crate::sanitize::truncate(.output.stderr.trim(), 512))]
    NonZeroExit { code: i32, output: ProcessOutput },

    #[error("Failed to collect command output: {0}")]
    Io(#[source] std::io::Error),

    #[error("Failed to start process runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Job {job_id} is not leased by '{worker_name}'")]
    NotLeased { job_id: String, worker_name: String },

    #[error("Job {job_id} cannot be removed while {status}")]
    InvalidState { job_id: String, status: String },

    #[error("Failed to encode job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Issue numbering for workspace '{workspace_id}' conflicted {attempts} times")]
    SerializationConflict { workspace_id: String, attempts: u32 },

    #[error("Workspace '{0}' not found")]
    UnknownWorkspace(String),

    #[error("Issue title must not be empty")]
    EmptyTitle,

    #[error("Store error: {0}")]
    Store(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Malformed job payload: {0}")]
    BadPayload(String),
}

pub type Result<T> = std::result::Result<T, SurfwatchError>;
