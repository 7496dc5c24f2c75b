//! Durable named job queues.
//!
//! Jobs live in the `jobs` table. Every transition is a conditional UPDATE
//! executed inside an IMMEDIATE transaction together with its side effects
//! (run counters, target rescan flag), and an event is published once the
//! transaction has committed. Delivery is at-least-once: a job whose lease
//! runs out is handed out again.

mod job;
mod retry;
mod run;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use rusqlite::Connection;
use serde::Serialize;

use crate::broadcast::{JobEvent, JobEventBroadcaster};
use crate::db::history_repo::{self, MemberOutcome};
use crate::db::job_repo::{self, JobFilter, JobRow};
use crate::db::{format_timestamp, target_repo, Database};
use crate::error::QueueError;

pub use job::{
    CreateIssueInput, Job, JobPayload, JobStatus, ToolInvocation, ISSUES_QUEUE, RESCANS_QUEUE,
    TOOLS_QUEUE,
};
pub use retry::Backoff;
pub use run::{JobHistoryRun, RunStatus};

/// Default time a worker may hold a job before it is considered crashed.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub queued: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Handle to all queues in one store. Cloning is cheap.
#[derive(Clone)]
pub struct JobQueue {
    db: Database,
    events: JobEventBroadcaster,
    backoff: Arc<HashMap<String, Backoff>>,
    default_backoff: Backoff,
    lease_duration: Duration,
    wakers: Arc<RwLock<HashMap<String, Sender<()>>>>,
}

impl JobQueue {
    pub fn new(db: Database, events: JobEventBroadcaster) -> Self {
        Self {
            db,
            events,
            backoff: Arc::new(HashMap::new()),
            default_backoff: Backoff::default(),
            lease_duration: DEFAULT_LEASE,
            wakers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Sets the backoff policy for one queue.
    pub fn with_backoff(mut self, queue_name: &str, backoff: Backoff) -> Self {
        Arc::make_mut(&mut self.backoff).insert(queue_name.to_string(), backoff);
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn events(&self) -> &JobEventBroadcaster {
        &self.events
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Registers the wake channel of the pool consuming `queue_name`.
    pub fn register_waker(&self, queue_name: &str, waker: Sender<()>) {
        match self.wakers.write() {
            Ok(mut wakers) => {
                wakers.insert(queue_name.to_string(), waker);
            }
            Err(poisoned) => {
                log::warn!("Queue waker lock was poisoned, recovering");
                poisoned.into_inner().insert(queue_name.to_string(), waker);
            }
        }
    }

    /// Nudges idle workers of a queue. A full channel already has a wakeup
    /// pending, so send failures are ignored.
    pub fn wake(&self, queue_name: &str) {
        let wakers = match self.wakers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(waker) = wakers.get(queue_name) {
            let _ = waker.try_send(());
        }
    }

    fn backoff_for(&self, queue_name: &str) -> Backoff {
        self.backoff
            .get(queue_name)
            .copied()
            .unwrap_or(self.default_backoff)
    }

    /// Adds a job to a queue and returns its ID.
    pub fn enqueue(
        &self,
        queue_name: &str,
        payload: &JobPayload,
        max_attempts: u32,
    ) -> Result<String, QueueError> {
        let now = Utc::now();
        let row = self
            .db
            .with_tx(|tx| insert_job(tx, queue_name, payload, max_attempts, None, now))?;

        log::debug!(
            "Enqueued {} job {} on '{}'",
            payload.kind(),
            row.id,
            queue_name
        );
        self.publish(&row, None);
        self.wake(queue_name);
        Ok(row.id)
    }

    /// Creates a JobHistoryRun and all its jobs atomically.
    pub fn enqueue_batch(
        &self,
        workflow_name: &str,
        queue_name: &str,
        payloads: &[JobPayload],
        max_attempts: u32,
    ) -> Result<(String, Vec<String>), QueueError> {
        let now = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();

        let (rows, run) = self.db.with_tx(|tx| -> Result<_, QueueError> {
            history_repo::create(
                tx,
                &run_id,
                workflow_name,
                payloads.len() as u32,
                &format_timestamp(now),
            )?;
            let mut rows = Vec::with_capacity(payloads.len());
            for payload in payloads {
                rows.push(insert_job(
                    tx,
                    queue_name,
                    payload,
                    max_attempts,
                    Some(&run_id),
                    now,
                )?);
            }
            let run = history_repo::find(tx, &run_id)?;
            Ok((rows, run))
        })?;

        log::info!(
            "Enqueued run {} ({}) with {} jobs on '{}'",
            run_id,
            workflow_name,
            rows.len(),
            queue_name
        );
        let run = run.as_ref().map(JobHistoryRun::from_row);
        for row in &rows {
            self.publish(row, run.clone());
        }
        self.wake(queue_name);
        Ok((run_id, rows.into_iter().map(|r| r.id).collect()))
    }

    /// Leases the oldest available job of a queue, or `None` when there is
    /// nothing to do.
    pub fn lease(&self, queue_name: &str, worker_name: &str) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let expires = now + chrono_duration(self.lease_duration);
        let row = self.db.with_conn(|conn| {
            job_repo::lease(
                conn,
                queue_name,
                worker_name,
                &format_timestamp(now),
                &format_timestamp(expires),
            )
        })?;

        match row {
            Some(row) => {
                let job = Job::from_row(&row)?;
                self.events.send(JobEvent::from_job(&job, None));
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Gives the current leaseholder `extra` more time on top of the
    /// configured lease duration, measured from now.
    pub fn extend_lease(
        &self,
        job_id: &str,
        worker_name: &str,
        extra: Duration,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        let expires = now + chrono_duration(self.lease_duration + extra);
        let extended = self.db.with_conn(|conn| {
            job_repo::extend_lease(
                conn,
                job_id,
                worker_name,
                &format_timestamp(expires),
                &format_timestamp(now),
            )
        })?;
        if extended {
            Ok(())
        } else {
            Err(QueueError::NotLeased {
                job_id: job_id.to_string(),
                worker_name: worker_name.to_string(),
            })
        }
    }

    /// `in_progress → completed` for the leaseholder.
    ///
    /// Completing a rescan job also returns its target to idle and stamps
    /// `last_discovered_at`.
    pub fn complete(
        &self,
        job_id: &str,
        worker_name: &str,
        result: Option<serde_json::Value>,
    ) -> Result<Job, QueueError> {
        let now = Utc::now();
        let now_str = format_timestamp(now);
        let result = result.map(|r| r.to_string());

        let (row, run) = self.db.with_tx(|tx| -> Result<_, QueueError> {
            if !job_repo::mark_completed(tx, job_id, worker_name, result.as_deref(), &now_str)? {
                return Err(not_leased(tx, job_id, worker_name)?);
            }
            let row = job_repo::find_by_id(tx, job_id)?
                .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
            if let Some(ref target_id) = row.target_id {
                target_repo::finish_rescan(tx, target_id, Some(&now_str))?;
            }
            let run = record_run_outcome(tx, &row, MemberOutcome::Completed, &now_str)?;
            Ok((row, run))
        })?;

        log::info!("Job {} completed by {}", job_id, worker_name);
        self.publish_terminal(row, run)
    }

    /// Records a failed attempt. The job goes back to the queue after the
    /// queue's backoff delay, or becomes terminally `failed` once it has
    /// used up `max_attempts`.
    pub fn fail(&self, job_id: &str, worker_name: &str, error: &str) -> Result<Job, QueueError> {
        self.fail_leased(job_id, worker_name, error, false)
    }

    /// Marks the job terminally failed regardless of remaining attempts.
    pub fn fail_permanently(
        &self,
        job_id: &str,
        worker_name: &str,
        error: &str,
    ) -> Result<Job, QueueError> {
        self.fail_leased(job_id, worker_name, error, true)
    }

    fn fail_leased(
        &self,
        job_id: &str,
        worker_name: &str,
        error: &str,
        permanent: bool,
    ) -> Result<Job, QueueError> {
        let now = Utc::now();
        let (row, run) = self.db.with_tx(|tx| -> Result<_, QueueError> {
            let row = match job_repo::find_leased(tx, job_id, worker_name)? {
                Some(row) => row,
                None => return Err(not_leased(tx, job_id, worker_name)?),
            };
            self.fail_attempt(tx, &row, error, permanent, now)
        })?;

        if row.status == JobStatus::Failed.as_str() {
            log::warn!(
                "Job {} failed permanently after {} attempt(s): {}",
                job_id,
                row.attempts,
                error
            );
        } else {
            log::info!(
                "Job {} attempt {} failed, retrying: {}",
                job_id,
                row.attempts,
                error
            );
            self.wake(&row.queue_name);
        }
        self.publish_terminal(row, run)
    }

    /// Shared by `fail`, `fail_permanently` and lease reaping. Must run
    /// inside a transaction with `row` currently `in_progress`.
    fn fail_attempt(
        &self,
        conn: &Connection,
        row: &JobRow,
        error: &str,
        permanent: bool,
        now: DateTime<Utc>,
    ) -> Result<(JobRow, Option<JobHistoryRun>), QueueError> {
        let now_str = format_timestamp(now);
        let attempts = row.attempts + 1;
        let error = crate::sanitize::truncate(error, 4096);

        let mut run = None;
        if !permanent && attempts < row.max_attempts {
            let delay = self.backoff_for(&row.queue_name).delay(attempts);
            let available_at = format_timestamp(now + chrono_duration(delay));
            job_repo::requeue(conn, &row.id, attempts, &error, &available_at, &now_str)?;
        } else {
            job_repo::mark_failed(conn, &row.id, attempts, &error, &now_str)?;
            if let Some(ref target_id) = row.target_id {
                target_repo::finish_rescan(conn, target_id, None)?;
            }
            run = record_run_outcome(conn, row, MemberOutcome::Failed, &now_str)?;
        }

        let updated = job_repo::find_by_id(conn, &row.id)?
            .ok_or_else(|| QueueError::NotFound(row.id.clone()))?;
        Ok((updated, run))
    }

    /// Treats every job whose lease ran out before `now` as a failed
    /// attempt. Returns the jobs after the transition.
    pub fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        let transitions = self.db.with_tx(|tx| -> Result<_, QueueError> {
            let expired = job_repo::expired_leases(tx, &format_timestamp(now))?;
            let mut out = Vec::with_capacity(expired.len());
            for row in &expired {
                log::warn!(
                    "Lease on job {} held by {} expired",
                    row.id,
                    row.worker_name.as_deref().unwrap_or("<unknown>")
                );
                out.push(self.fail_attempt(tx, row, "lease expired", false, now)?);
            }
            Ok(out)
        })?;

        let mut jobs = Vec::with_capacity(transitions.len());
        for (row, run) in transitions {
            if row.status == JobStatus::Queued.as_str() {
                self.wake(&row.queue_name);
            }
            jobs.push(self.publish_terminal(row, run)?);
        }
        Ok(jobs)
    }

    /// Deletes a queued (cancellation) or terminal job. Jobs in progress
    /// can't be removed.
    pub fn remove(&self, job_id: &str) -> Result<(), QueueError> {
        let now_str = format_timestamp(Utc::now());
        let (row, run) = self.db.with_tx(|tx| -> Result<_, QueueError> {
            let row = job_repo::find_by_id(tx, job_id)?
                .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
            if row.status == JobStatus::InProgress.as_str() {
                return Err(QueueError::InvalidState {
                    job_id: job_id.to_string(),
                    status: row.status.clone(),
                });
            }
            job_repo::delete(tx, job_id)?;

            let mut run = None;
            if row.status == JobStatus::Queued.as_str() {
                if let Some(ref run_id) = row.run_id {
                    history_repo::shrink(tx, run_id, &now_str)?;
                    run = history_repo::find(tx, run_id)?;
                }
                if let Some(ref target_id) = row.target_id {
                    target_repo::finish_rescan(tx, target_id, None)?;
                }
            }
            Ok((row, run))
        })?;

        log::info!("Removed job {} ({})", job_id, row.status);
        let job = Job::from_row(&row)?;
        self.events.send(JobEvent::removed(
            &job,
            run.as_ref().map(JobHistoryRun::from_row),
        ));
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let row = self.db.with_conn(|conn| job_repo::find_by_id(conn, job_id))?;
        Ok(row.as_ref().map(Job::from_row).transpose()?)
    }

    /// Jobs matching `filter`, newest first, with the unpaginated total.
    pub fn query(&self, filter: &JobFilter) -> Result<(Vec<Job>, u64), QueueError> {
        let (rows, total) = self.db.with_conn(|conn| job_repo::query(conn, filter))?;
        let jobs = rows
            .iter()
            .map(Job::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((jobs, total))
    }

    pub fn counts(&self) -> Result<JobCounts, QueueError> {
        let counts = self.db.with_conn(|conn| {
            Ok(JobCounts {
                queued: job_repo::count_by_status(conn, JobStatus::Queued.as_str())?,
                in_progress: job_repo::count_by_status(conn, JobStatus::InProgress.as_str())?,
                completed: job_repo::count_by_status(conn, JobStatus::Completed.as_str())?,
                failed: job_repo::count_by_status(conn, JobStatus::Failed.as_str())?,
            })
        })?;
        Ok(counts)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<JobHistoryRun>, QueueError> {
        let row = self.db.with_conn(|conn| history_repo::find(conn, run_id))?;
        Ok(row.as_ref().map(JobHistoryRun::from_row))
    }

    pub fn list_runs(&self, limit: u32) -> Result<Vec<JobHistoryRun>, QueueError> {
        let rows = self.db.with_conn(|conn| history_repo::list(conn, limit))?;
        Ok(rows.iter().map(JobHistoryRun::from_row).collect())
    }

    /// Publishes the event for a job inserted by a caller-owned transaction
    /// (the scheduler) once that transaction has committed.
    pub(crate) fn announce_enqueued(&self, row: &JobRow, run: Option<JobHistoryRun>) {
        self.publish(row, run);
        self.wake(&row.queue_name);
    }

    fn publish(&self, row: &JobRow, run: Option<JobHistoryRun>) {
        match Job::from_row(row) {
            Ok(job) => self.events.send(JobEvent::from_job(&job, run)),
            Err(e) => log::error!("Failed to decode job {} for event: {}", row.id, e),
        }
    }

    fn publish_terminal(
        &self,
        row: JobRow,
        run: Option<JobHistoryRun>,
    ) -> Result<Job, QueueError> {
        let job = Job::from_row(&row)?;
        self.events.send(JobEvent::from_job(&job, run));
        Ok(job)
    }
}

/// Inserts a queued job row. Runs on the caller's connection so it can be
/// part of a larger transaction.
pub(crate) fn insert_job(
    conn: &Connection,
    queue_name: &str,
    payload: &JobPayload,
    max_attempts: u32,
    run_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<JobRow, QueueError> {
    let now = format_timestamp(now);
    let row = JobRow {
        id: uuid::Uuid::new_v4().to_string(),
        queue_name: queue_name.to_string(),
        payload: serde_json::to_string(payload)?,
        status: JobStatus::Queued.as_str().to_string(),
        attempts: 0,
        max_attempts: max_attempts.max(1),
        created_at: now.clone(),
        updated_at: now.clone(),
        available_at: now,
        lease_expires_at: None,
        completed_at: None,
        worker_name: None,
        result: None,
        error: None,
        run_id: run_id.map(str::to_string),
        target_id: payload.subject_target().map(str::to_string),
    };
    job_repo::insert(conn, &row)?;
    Ok(row)
}

fn record_run_outcome(
    conn: &Connection,
    row: &JobRow,
    outcome: MemberOutcome,
    now: &str,
) -> Result<Option<JobHistoryRun>, QueueError> {
    let Some(ref run_id) = row.run_id else {
        return Ok(None);
    };
    history_repo::record_terminal(conn, run_id, outcome, now)?;
    Ok(history_repo::find(conn, run_id)?
        .as_ref()
        .map(JobHistoryRun::from_row))
}

/// Explains why a leaseholder-only transition matched no row.
fn not_leased(
    conn: &Connection,
    job_id: &str,
    worker_name: &str,
) -> Result<QueueError, QueueError> {
    match job_repo::find_by_id(conn, job_id)? {
        None => Ok(QueueError::NotFound(job_id.to_string())),
        Some(_) => Ok(QueueError::NotLeased {
            job_id: job_id.to_string(),
            worker_name: worker_name.to_string(),
        }),
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}
