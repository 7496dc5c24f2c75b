//! Executes a leased job and records the outcome on the queue.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::db::target_repo::{self, TargetRow};
use crate::error::{ConfigError, IngestError, ProcessError, QueueError, WorkerError};
use crate::ingest::{FindingsSummary, IngestionPipeline};
use crate::queue::{CreateIssueInput, Job, JobPayload, JobQueue, ToolInvocation};
use crate::sanitize::{shell_quote, truncate};
use crate::tool::{self, parser, ProcessRunner, ToolCatalog, ToolDefinition, BUILTIN_BINDINGS};

const MAX_STDERR_CHARS: usize = 4_096;

/// How a failed job should be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Worth another attempt after backoff.
    Retryable(String),
    /// Will fail the same way every time.
    Fatal(String),
}

impl DispatchError {
    pub fn message(&self) -> &str {
        match self {
            DispatchError::Retryable(m) | DispatchError::Fatal(m) => m,
        }
    }
}

impl From<ConfigError> for DispatchError {
    fn from(e: ConfigError) -> Self {
        DispatchError::Fatal(e.to_string())
    }
}

impl From<ProcessError> for DispatchError {
    fn from(e: ProcessError) -> Self {
        DispatchError::Retryable(e.to_string())
    }
}

impl From<QueueError> for DispatchError {
    fn from(e: QueueError) -> Self {
        DispatchError::Retryable(e.to_string())
    }
}

impl From<crate::db::DatabaseError> for DispatchError {
    fn from(e: crate::db::DatabaseError) -> Self {
        DispatchError::Retryable(e.to_string())
    }
}

impl From<IngestError> for DispatchError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::EmptyTitle | IngestError::UnknownWorkspace(_) => {
                DispatchError::Fatal(e.to_string())
            }
            IngestError::SerializationConflict { .. } | IngestError::Store(_) => {
                DispatchError::Retryable(e.to_string())
            }
        }
    }
}

impl From<WorkerError> for DispatchError {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::BadPayload(_) => DispatchError::Fatal(e.to_string()),
            _ => DispatchError::Retryable(e.to_string()),
        }
    }
}

/// What a finished tool run reports as its job result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRunReport {
    pub tool_id: String,
    pub exit_code: i32,
    pub duration_ms: u128,
    pub findings: usize,
    pub skipped_lines: usize,
    pub ingested: FindingsSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

/// Checks a tool run can be bound before it is enqueued, so that
/// configuration mistakes reach the caller instead of the failed list.
pub fn check_invocation(
    catalog: &ToolCatalog,
    invocation: &ToolInvocation,
) -> Result<(), ConfigError> {
    let def = catalog.get(&invocation.tool_id)?;
    def.check_args(&invocation.args)?;
    for (name, value) in &invocation.args {
        tool::check_value(name, value)?;
    }

    let mut values = invocation.args.clone();
    for name in BUILTIN_BINDINGS {
        values.insert(name.to_string(), String::new());
    }
    tool::validate_binding(&def.command, &values)
}

/// Binding values for one run. Every value is screened and shell-quoted.
fn bindings(
    invocation_args: &BTreeMap<String, String>,
    targets: &[TargetRow],
    target_ids: &[String],
    asset_ids: &[String],
) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut values = BTreeMap::new();
    for (name, value) in invocation_args {
        tool::check_value(name, value)?;
        values.insert(name.clone(), shell_quote(value));
    }
    for target in targets {
        tool::check_value("targets", &target.value)?;
    }
    values.insert(
        "targets".to_string(),
        targets
            .iter()
            .map(|t| shell_quote(&t.value))
            .collect::<Vec<_>>()
            .join(" "),
    );
    values.insert("target_ids".to_string(), shell_quote(&target_ids.join(",")));
    values.insert("asset_ids".to_string(), shell_quote(&asset_ids.join(",")));
    Ok(values)
}

/// Runs jobs of every payload kind. Shared by all workers of a pool.
pub struct Dispatcher {
    queue: JobQueue,
    catalog: Arc<ToolCatalog>,
    runner: ProcessRunner,
    ingestion: IngestionPipeline,
    rescan_tools: Vec<String>,
}

impl Dispatcher {
    pub fn new(
        queue: JobQueue,
        catalog: Arc<ToolCatalog>,
        runner: ProcessRunner,
        ingestion: IngestionPipeline,
        rescan_tools: Vec<String>,
    ) -> Self {
        Self {
            queue,
            catalog,
            runner,
            ingestion,
            rescan_tools,
        }
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Runs a leased job and records the outcome. Errors end up on the job
    /// row; nothing escapes to the worker loop.
    pub fn handle(&self, job: &Job, worker_name: &str) {
        let span = tracing::info_span!(
            "job",
            job_id = %job.id,
            queue = %job.queue_name,
            attempt = job.attempts + 1,
        );
        let _enter = span.enter();

        let recorded = match self.dispatch(job, worker_name) {
            Ok(result) => self
                .queue
                .complete(&job.id, worker_name, Some(result))
                .map(|_| ()),
            Err(DispatchError::Retryable(message)) => {
                log::warn!(
                    "Job {} attempt {}/{} failed: {}",
                    job.id,
                    job.attempts + 1,
                    job.max_attempts,
                    message
                );
                self.queue.fail(&job.id, worker_name, &message).map(|_| ())
            }
            Err(DispatchError::Fatal(message)) => {
                log::error!("Job {} cannot succeed: {}", job.id, message);
                self.queue
                    .fail_permanently(&job.id, worker_name, &message)
                    .map(|_| ())
            }
        };

        match recorded {
            Ok(()) => {}
            Err(QueueError::NotLeased { .. }) => {
                log::warn!(
                    "Lease on job {} was lost before {} could record the outcome",
                    job.id,
                    worker_name
                );
            }
            Err(e) => log::error!("Failed to record outcome of job {}: {}", job.id, e),
        }
    }

    /// Executes the job without touching its queue status.
    pub fn dispatch(&self, job: &Job, worker_name: &str) -> Result<Value, DispatchError> {
        let payload = job
            .payload()
            .map_err(|e| WorkerError::BadPayload(e.to_string()))?;

        log::debug!("Dispatching {} job {}", payload.kind(), job.id);

        match payload {
            JobPayload::ToolRun(invocation) => {
                let report = self.run_tool(
                    &job.id,
                    worker_name,
                    &invocation.tool_id,
                    &invocation.args,
                    &invocation.target_ids,
                    &invocation.asset_ids,
                )?;
                to_value(&report)
            }
            JobPayload::CreateIssue {
                workspace_id,
                user_id,
                input,
            } => self.create_issue(&input, &workspace_id, &user_id),
            JobPayload::ScheduledRescan { target_id } => {
                self.rescan(&job.id, worker_name, &target_id)
            }
        }
    }

    fn create_issue(
        &self,
        input: &CreateIssueInput,
        workspace_id: &str,
        user_id: &str,
    ) -> Result<Value, DispatchError> {
        let issue = self.ingestion.ingest(input, workspace_id, user_id)?;
        to_value(&issue)
    }

    fn rescan(
        &self,
        job_id: &str,
        worker_name: &str,
        target_id: &str,
    ) -> Result<Value, DispatchError> {
        let exists = self
            .queue
            .database()
            .with_conn(|conn| target_repo::find(conn, target_id))?
            .is_some();
        if !exists {
            log::info!("Target {} was removed, skipping rescan", target_id);
            return Ok(json!({ "targetId": target_id, "status": "target removed" }));
        }

        let target_ids = vec![target_id.to_string()];
        let mut reports = Vec::with_capacity(self.rescan_tools.len());
        for tool_id in &self.rescan_tools {
            reports.push(self.run_tool(
                job_id,
                worker_name,
                tool_id,
                &BTreeMap::new(),
                &target_ids,
                &[],
            )?);
        }

        Ok(json!({ "targetId": target_id, "tools": reports }))
    }

    fn run_tool(
        &self,
        job_id: &str,
        worker_name: &str,
        tool_id: &str,
        args: &BTreeMap<String, String>,
        target_ids: &[String],
        asset_ids: &[String],
    ) -> Result<ToolRunReport, DispatchError> {
        let def: &ToolDefinition = self.catalog.get(tool_id)?;
        def.check_args(args)?;

        let targets = self
            .queue
            .database()
            .with_conn(|conn| target_repo::find_many(conn, target_ids))?;
        let values = bindings(args, &targets, target_ids, asset_ids)?;
        tool::validate_binding(&def.command, &values)?;
        let command = tool::bind(&def.command, &values);

        // The run may take up to the tool timeout; keep the lease ahead of it.
        self.queue.extend_lease(job_id, worker_name, def.timeout())?;

        let span = tracing::info_span!(
            "tool",
            tool_id = %def.id,
            program = crate::sanitize::command_program(&command),
        );
        let _enter = span.enter();

        let output = match self.runner.run_blocking(&command, def.timeout()) {
            Ok(output) => output,
            Err(ProcessError::NonZeroExit { code, output }) if def.accepts_exit_code(code) => {
                log::debug!("{} exited with accepted code {}", def.id, code);
                output
            }
            Err(e) => return Err(e.into()),
        };
        if !def.accepts_exit_code(output.exit_code) {
            return Err(DispatchError::Retryable(format!(
                "{} exited with code {} which is not accepted",
                def.id, output.exit_code
            )));
        }

        let parsed = parser::parse(def.output, &output.stdout);
        let ingested = self
            .ingestion
            .ingest_for_targets(target_ids, &def.id, &parsed.findings)?;

        log::info!(
            "{} finished in {:?}: {} findings, {} new assets",
            def.id,
            output.duration,
            parsed.findings.len(),
            ingested.assets_new
        );

        Ok(ToolRunReport {
            tool_id: def.id.clone(),
            exit_code: output.exit_code,
            duration_ms: output.duration.as_millis(),
            findings: parsed.findings.len(),
            skipped_lines: parsed.skipped,
            ingested,
            raw: parsed.raw,
            stderr: truncate(output.stderr.trim(), MAX_STDERR_CHARS),
        })
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, DispatchError> {
    serde_json::to_value(value).map_err(|e| DispatchError::Fatal(e.to_string()))
}
