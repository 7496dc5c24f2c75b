//! JobHistoryRun: the aggregate view of a batch of jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::history_repo::RunRow;
use crate::db::parse_timestamp;

/// Aggregate status of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(RunStatus::InProgress),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHistoryRun {
    pub id: String,
    pub workflow_name: String,
    pub total_jobs: u32,
    pub completed_jobs: u32,
    pub failed_jobs: u32,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobHistoryRun {
    pub fn from_row(row: &RunRow) -> Self {
        let status = RunStatus::parse(&row.status).unwrap_or_else(|| {
            log::warn!("Unknown run status '{}' for run {}", row.status, row.id);
            RunStatus::InProgress
        });
        Self {
            id: row.id.clone(),
            workflow_name: row.workflow_name.clone(),
            total_jobs: row.total_jobs,
            completed_jobs: row.completed_jobs,
            failed_jobs: row.failed_jobs,
            status,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        }
    }

    /// Members that have not reached a terminal state yet.
    pub fn pending_jobs(&self) -> u32 {
        self.total_jobs
            .saturating_sub(self.completed_jobs + self.failed_jobs)
    }
}
