//! JobHistoryRun repository.
//!
//! A run aggregates a batch of jobs. Its counters are bumped in the same
//! transaction as each member's terminal transition and the status is
//! recomputed from the counters, so the aggregate does not depend on member
//! rows still existing.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw run row from the database.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: String,
    pub workflow_name: String,
    pub total_jobs: u32,
    pub completed_jobs: u32,
    pub failed_jobs: u32,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            workflow_name: row.get("workflow_name")?,
            total_jobs: row.get("total_jobs")?,
            completed_jobs: row.get("completed_jobs")?,
            failed_jobs: row.get("failed_jobs")?,
            status: row.get("status")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Terminal outcome of a member job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberOutcome {
    Completed,
    Failed,
}

const REFRESH_STATUS: &str = "UPDATE job_history_runs SET status = CASE
        WHEN completed_jobs + failed_jobs < total_jobs THEN 'in_progress'
        WHEN failed_jobs > 0 THEN 'failed'
        ELSE 'completed'
    END, updated_at = ?2
    WHERE id = ?1";

/// Creates a run with the given number of members. A run with no members
/// is complete from the start.
pub fn create(
    conn: &Connection,
    id: &str,
    workflow_name: &str,
    total_jobs: u32,
    now: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO job_history_runs (id, workflow_name, total_jobs, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'in_progress', ?4, ?4)",
        params![id, workflow_name, total_jobs, now],
    )?;
    conn.execute(REFRESH_STATUS, params![id, now])?;
    Ok(())
}

/// Grows a run by `count` members (the scheduler adds to its run per claim).
pub fn add_jobs(conn: &Connection, id: &str, count: u32, now: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE job_history_runs SET total_jobs = total_jobs + ?2 WHERE id = ?1",
        params![id, count],
    )?;
    conn.execute(REFRESH_STATUS, params![id, now])?;
    Ok(())
}

/// Records one member reaching a terminal state and refreshes the status.
pub fn record_terminal(
    conn: &Connection,
    id: &str,
    outcome: MemberOutcome,
    now: &str,
) -> Result<(), DatabaseError> {
    let sql = match outcome {
        MemberOutcome::Completed => {
            "UPDATE job_history_runs SET completed_jobs = completed_jobs + 1 WHERE id = ?1"
        }
        MemberOutcome::Failed => {
            "UPDATE job_history_runs SET failed_jobs = failed_jobs + 1 WHERE id = ?1"
        }
    };
    conn.execute(sql, params![id])?;
    conn.execute(REFRESH_STATUS, params![id, now])?;
    Ok(())
}

/// Drops one member that was cancelled before it ran.
pub fn shrink(conn: &Connection, id: &str, now: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE job_history_runs SET total_jobs = MAX(total_jobs - 1, 0) WHERE id = ?1",
        params![id],
    )?;
    conn.execute(REFRESH_STATUS, params![id, now])?;
    Ok(())
}

/// Finds a run by ID.
pub fn find(conn: &Connection, id: &str) -> Result<Option<RunRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM job_history_runs WHERE id = ?1",
            params![id],
            RunRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Lists the most recent runs, newest first.
pub fn list(conn: &Connection, limit: u32) -> Result<Vec<RunRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM job_history_runs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit], RunRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
