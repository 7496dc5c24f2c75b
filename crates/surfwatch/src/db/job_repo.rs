//! Job repository: row-level operations on the `jobs` table.
//!
//! Functions take a `&Connection` so callers can compose them inside one
//! transaction (see `Database::with_tx`). Every state change is a
//! conditional UPDATE guarded by the expected current status, so two
//! connections racing on the same row cannot both succeed.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub queue_name: String,
    pub payload: String,
    pub status: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: String,
    pub updated_at: String,
    pub available_at: String,
    pub lease_expires_at: Option<String>,
    pub completed_at: Option<String>,
    pub worker_name: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub run_id: Option<String>,
    pub target_id: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            queue_name: row.get("queue_name")?,
            payload: row.get("payload")?,
            status: row.get("status")?,
            attempts: row.get("attempts")?,
            max_attempts: row.get("max_attempts")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            available_at: row.get("available_at")?,
            lease_expires_at: row.get("lease_expires_at")?,
            completed_at: row.get("completed_at")?,
            worker_name: row.get("worker_name")?,
            result: row.get("result")?,
            error: row.get("error")?,
            run_id: row.get("run_id")?,
            target_id: row.get("target_id")?,
        })
    }
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<String>,
    pub queue_name: Option<String>,
    pub run_id: Option<String>,
    pub target_id: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a new job row.
pub fn insert(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, queue_name, payload, status, attempts, max_attempts, created_at,
         updated_at, available_at, lease_expires_at, completed_at, worker_name, result, error,
         run_id, target_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            job.id,
            job.queue_name,
            job.payload,
            job.status,
            job.attempts,
            job.max_attempts,
            job.created_at,
            job.updated_at,
            job.available_at,
            job.lease_expires_at,
            job.completed_at,
            job.worker_name,
            job.result,
            job.error,
            job.run_id,
            job.target_id,
        ],
    )?;
    Ok(())
}

/// Atomically claims the oldest available queued job of a queue.
///
/// Selection and the status flip happen in one statement, so concurrent
/// callers on any connection each get a different job or none.
pub fn lease(
    conn: &Connection,
    queue_name: &str,
    worker_name: &str,
    now: &str,
    lease_expires_at: &str,
) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row(
            "UPDATE jobs SET status = 'in_progress', worker_name = ?2, updated_at = ?3,
             lease_expires_at = ?4
             WHERE status = 'queued' AND id = (
                 SELECT id FROM jobs
                 WHERE queue_name = ?1 AND status = 'queued' AND available_at <= ?3
                 ORDER BY created_at, rowid
                 LIMIT 1
             )
             RETURNING *",
            params![queue_name, worker_name, now, lease_expires_at],
            JobRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Finds a job by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], JobRow::from_row)
        .optional()?;
    Ok(row)
}

/// Finds a job only if it is in progress under the given worker.
pub fn find_leased(
    conn: &Connection,
    id: &str,
    worker_name: &str,
) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM jobs WHERE id = ?1 AND status = 'in_progress' AND worker_name = ?2",
            params![id, worker_name],
            JobRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Pushes the lease deadline of a held job forward.
pub fn extend_lease(
    conn: &Connection,
    id: &str,
    worker_name: &str,
    lease_expires_at: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET lease_expires_at = ?3, updated_at = ?4
         WHERE id = ?1 AND status = 'in_progress' AND worker_name = ?2",
        params![id, worker_name, lease_expires_at, now],
    )?;
    Ok(changed == 1)
}

/// `in_progress → completed` for the current leaseholder. Returns whether a
/// row changed.
pub fn mark_completed(
    conn: &Connection,
    id: &str,
    worker_name: &str,
    result: Option<&str>,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = 'completed', result = ?3, error = NULL, updated_at = ?4,
         completed_at = ?4, lease_expires_at = NULL
         WHERE id = ?1 AND status = 'in_progress' AND worker_name = ?2",
        params![id, worker_name, result, now],
    )?;
    Ok(changed == 1)
}

/// Puts an in-progress job back in the queue after a failed attempt.
pub fn requeue(
    conn: &Connection,
    id: &str,
    attempts: u32,
    error: &str,
    available_at: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = 'queued', attempts = ?2, error = ?3, available_at = ?4,
         updated_at = ?5, lease_expires_at = NULL
         WHERE id = ?1 AND status = 'in_progress'",
        params![id, attempts, error, available_at, now],
    )?;
    Ok(changed == 1)
}

/// Moves an in-progress job to the terminal `failed` state.
pub fn mark_failed(
    conn: &Connection,
    id: &str,
    attempts: u32,
    error: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = 'failed', attempts = ?2, error = ?3, updated_at = ?4,
         completed_at = ?4, lease_expires_at = NULL
         WHERE id = ?1 AND status = 'in_progress'",
        params![id, attempts, error, now],
    )?;
    Ok(changed == 1)
}

/// Deletes a job row.
pub fn delete(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
    Ok(changed == 1)
}

/// Returns in-progress jobs whose lease deadline has passed.
pub fn expired_leases(conn: &Connection, now: &str) -> Result<Vec<JobRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM jobs WHERE status = 'in_progress' AND lease_expires_at IS NOT NULL
         AND lease_expires_at < ?1 ORDER BY lease_expires_at",
    )?;
    let rows = stmt
        .query_map(params![now], JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Queries jobs with filters, returning (rows, total_count).
pub fn query(conn: &Connection, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    let mut conditions = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(ref status) = filter.status {
        conditions.push(format!("status = ?{}", param_values.len() + 1));
        param_values.push(Box::new(status.clone()));
    }
    if let Some(ref queue_name) = filter.queue_name {
        conditions.push(format!("queue_name = ?{}", param_values.len() + 1));
        param_values.push(Box::new(queue_name.clone()));
    }
    if let Some(ref run_id) = filter.run_id {
        conditions.push(format!("run_id = ?{}", param_values.len() + 1));
        param_values.push(Box::new(run_id.clone()));
    }
    if let Some(ref target_id) = filter.target_id {
        conditions.push(format!("target_id = ?{}", param_values.len() + 1));
        param_values.push(Box::new(target_id.clone()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

    let limit = filter.limit.unwrap_or(100) as i64;
    let offset = filter.offset.unwrap_or(0) as i64;
    param_values.push(Box::new(limit));
    param_values.push(Box::new(offset));
    let query_sql = format!(
        "SELECT * FROM jobs {} ORDER BY created_at DESC, rowid DESC LIMIT ?{} OFFSET ?{}",
        where_clause,
        param_values.len() - 1,
        param_values.len()
    );

    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&query_sql)?;
    let rows: Vec<JobRow> = stmt
        .query_map(params_ref.as_slice(), JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok((rows, total))
}

/// Counts jobs with the given status.
pub fn count_by_status(conn: &Connection, status: &str) -> Result<u64, DatabaseError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM jobs WHERE status = ?1",
        params![status],
        |r| r.get(0),
    )?;
    Ok(count)
}
