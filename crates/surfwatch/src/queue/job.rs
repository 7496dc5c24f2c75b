//! Typed view of a queued job and its payload.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::job_repo::JobRow;
use crate::db::{parse_timestamp, DatabaseError};

/// Queue that tool executions go to by default.
pub const TOOLS_QUEUE: &str = "tools";
/// Queue for issue creation. Ordering-sensitive, run with concurrency 1.
pub const ISSUES_QUEUE: &str = "issues";
/// Queue for schedule-triggered target rescans.
pub const RESCANS_QUEUE: &str = "rescans";

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "in_progress" => Some(JobStatus::InProgress),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Completed and failed jobs never change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to run one catalog tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub tool_id: String,
    /// Values for the tool's declared arguments.
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub target_ids: Vec<String>,
    #[serde(default)]
    pub asset_ids: Vec<String>,
}

/// Input for creating a tracked issue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CreateIssueInput {
    pub title: String,
    /// Stored as the first, non-deletable comment when present.
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// What a job asks a worker to do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    ToolRun(ToolInvocation),
    CreateIssue {
        workspace_id: String,
        user_id: String,
        input: CreateIssueInput,
    },
    ScheduledRescan {
        target_id: String,
    },
}

impl JobPayload {
    /// The queue this kind of payload is normally sent to.
    pub fn default_queue(&self) -> &'static str {
        match self {
            JobPayload::ToolRun(_) => TOOLS_QUEUE,
            JobPayload::CreateIssue { .. } => ISSUES_QUEUE,
            JobPayload::ScheduledRescan { .. } => RESCANS_QUEUE,
        }
    }

    /// Target the job works on, recorded on the row for rescan bookkeeping.
    pub fn subject_target(&self) -> Option<&str> {
        match self {
            JobPayload::ScheduledRescan { target_id } => Some(target_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::ToolRun(_) => "tool_run",
            JobPayload::CreateIssue { .. } => "create_issue",
            JobPayload::ScheduledRescan { .. } => "scheduled_rescan",
        }
    }
}

/// A job as seen by the queue and the workers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub queue_name: String,
    /// Raw payload; decode with [`Job::payload`].
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
}

impl Job {
    /// Decodes the payload. Fails for rows written by an incompatible build.
    pub fn payload(&self) -> Result<JobPayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn from_row(row: &JobRow) -> Result<Self, DatabaseError> {
        let status = JobStatus::parse(&row.status).unwrap_or_else(|| {
            log::warn!(
                "Unknown job status '{}' for job {}, treating as failed",
                row.status,
                row.id
            );
            JobStatus::Failed
        });
        let payload: serde_json::Value =
            serde_json::from_str(&row.payload).map_err(|source| DatabaseError::Json {
                column: "payload",
                source,
            })?;
        let result = row
            .result
            .as_deref()
            .map(serde_json::from_str::<serde_json::Value>)
            .transpose()
            .map_err(|source| DatabaseError::Json {
                column: "result",
                source,
            })?;

        Ok(Self {
            id: row.id.clone(),
            queue_name: row.queue_name.clone(),
            payload,
            status,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
            completed_at: row.completed_at.as_deref().map(parse_timestamp),
            worker_name: row.worker_name.clone(),
            result,
            error: row.error.clone(),
            run_id: row.run_id.clone(),
            target_id: row.target_id.clone(),
        })
    }
}
