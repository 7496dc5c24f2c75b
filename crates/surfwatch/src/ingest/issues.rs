//! Issue creation with gap-free per-workspace numbering.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::issue_repo::{self, CommentRow, IssueRow};
use crate::db::{format_timestamp, parse_timestamp, target_repo, Database, DatabaseError};
use crate::error::IngestError;
use crate::queue::CreateIssueInput;

/// Attempts before numbering gives up with `SerializationConflict`.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: String,
    pub no: u32,
    pub title: String,
    pub status: IssueStatus,
    pub workspace_id: String,
    pub created_by_id: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    fn from_row(row: &IssueRow) -> Result<Self, DatabaseError> {
        let tags = serde_json::from_str(&row.tags)
            .map_err(|source| DatabaseError::Json {
                column: "tags",
                source,
            })?;
        Ok(Self {
            id: row.id.clone(),
            no: row.no,
            title: row.title.clone(),
            status: if row.status == "closed" {
                IssueStatus::Closed
            } else {
                IssueStatus::Open
            },
            workspace_id: row.workspace_id.clone(),
            created_by_id: row.created_by_id.clone(),
            tags,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        })
    }
}

/// Persists scan outcomes: issues here, assets and vulnerabilities in
/// `findings`.
#[derive(Clone)]
pub struct IngestionPipeline {
    pub(super) db: Database,
    max_retries: u32,
    retry_backoff: Duration,
}

impl IngestionPipeline {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_retry(mut self, max_retries: u32, retry_backoff: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_backoff = retry_backoff;
        self
    }

    /// Creates an issue numbered `max(no) + 1` within its workspace, along
    /// with the description as its first, non-deletable comment.
    ///
    /// Numbering reads and writes under the store's write lock. If another
    /// writer still gets in the way (busy store, or the unique constraint
    /// catching a duplicate number) the whole transaction is retried.
    pub fn ingest(
        &self,
        input: &CreateIssueInput,
        workspace_id: &str,
        user_id: &str,
    ) -> Result<Issue, IngestError> {
        let title = input.title.trim();
        if title.is_empty() {
            return Err(IngestError::EmptyTitle);
        }

        for attempt in 1..=self.max_retries {
            match self.try_ingest(title, input, workspace_id, user_id) {
                Ok(issue) => {
                    log::info!(
                        "Created issue #{} in workspace {}",
                        issue.no,
                        workspace_id
                    );
                    return Ok(issue);
                }
                Err(IngestError::Store(e)) if e.is_conflict() => {
                    log::debug!(
                        "Issue numbering conflict in workspace {} (attempt {}): {}",
                        workspace_id,
                        attempt,
                        e
                    );
                    std::thread::sleep(self.retry_backoff * attempt);
                }
                Err(e) => return Err(e),
            }
        }

        log::warn!(
            "Giving up on issue numbering in workspace {} after {} attempts",
            workspace_id,
            self.max_retries
        );
        Err(IngestError::SerializationConflict {
            workspace_id: workspace_id.to_string(),
            attempts: self.max_retries,
        })
    }

    fn try_ingest(
        &self,
        title: &str,
        input: &CreateIssueInput,
        workspace_id: &str,
        user_id: &str,
    ) -> Result<Issue, IngestError> {
        let now = format_timestamp(Utc::now());
        let tags = serde_json::to_string(&input.tags).map_err(|source| DatabaseError::Json {
            column: "tags",
            source,
        })?;

        let row = self.db.with_tx(|tx| -> Result<_, IngestError> {
            if !target_repo::workspace_exists(tx, workspace_id)? {
                return Err(IngestError::UnknownWorkspace(workspace_id.to_string()));
            }

            let row = IssueRow {
                id: uuid::Uuid::new_v4().to_string(),
                no: issue_repo::max_no(tx, workspace_id)? + 1,
                title: title.to_string(),
                status: "open".to_string(),
                workspace_id: workspace_id.to_string(),
                created_by_id: user_id.to_string(),
                tags: tags.clone(),
                created_at: now.clone(),
                updated_at: now.clone(),
            };
            issue_repo::insert(tx, &row)?;

            if let Some(description) = input.description.as_deref().filter(|d| !d.trim().is_empty())
            {
                issue_repo::insert_comment(
                    tx,
                    &CommentRow {
                        id: uuid::Uuid::new_v4().to_string(),
                        issue_id: row.id.clone(),
                        content: description.to_string(),
                        created_by_id: user_id.to_string(),
                        is_deletable: false,
                        created_at: now.clone(),
                    },
                )?;
            }
            Ok(row)
        })?;

        Ok(Issue::from_row(&row)?)
    }

    /// A workspace's issues ordered by number.
    pub fn list_issues(&self, workspace_id: &str) -> Result<Vec<Issue>, IngestError> {
        let rows = self.db.with_conn(|conn| issue_repo::list(conn, workspace_id))?;
        Ok(rows
            .iter()
            .map(Issue::from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }
}
