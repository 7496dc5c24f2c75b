pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod orchestrator;
pub mod queue;
pub mod sanitize;
pub mod scheduler;
pub mod tool;
pub mod worker;

pub use broadcast::{JobEvent, JobEventBroadcaster, JobStore};
pub use config::{load_config, Config};
pub use db::Database;
pub use error::{
    ConfigError, IngestError, ProcessError, QueueError, Result, SurfwatchError, WorkerError,
};
pub use ingest::{FindingsSummary, IngestionPipeline, Issue};
pub use orchestrator::Orchestrator;
pub use queue::{CreateIssueInput, Job, JobPayload, JobQueue, JobStatus, ToolInvocation};
pub use scheduler::{ScanSchedule, Scheduler, SchedulerSettings};
pub use tool::{ProcessRunner, ToolCatalog, ToolDefinition};
pub use worker::{DispatchError, Dispatcher, WorkerPool};
