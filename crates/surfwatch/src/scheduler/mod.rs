//! Periodic rescan scheduler.
//!
//! Each tick:
//! 1. reaps jobs whose lease ran out (crashed workers),
//! 2. re-arms targets whose rescan flag went stale with no job behind it,
//! 3. claims every due target and enqueues a rescan job for it.
//!
//! The claim is a conditional flip of `targets.is_rescan` performed in the
//! same transaction as the job insert, so overlapping ticks (in this or
//! another process) enqueue at most one job per target.

mod schedule;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::history_repo;
use crate::db::job_repo::JobRow;
use crate::db::{format_timestamp, parse_timestamp, target_repo};
use crate::error::QueueError;
use crate::queue::{self, JobHistoryRun, JobPayload, JobQueue, RESCANS_QUEUE};

pub use schedule::ScanSchedule;

/// Workflow name of the run each tick groups its rescans under.
pub const SCHEDULED_RESCAN_WORKFLOW: &str = "scheduled-rescan";

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    /// A set rescan flag older than this with no live job is cleared.
    pub rescan_stale_after: Duration,
    pub max_attempts: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            rescan_stale_after: Duration::from_secs(6 * 60 * 60),
            max_attempts: 3,
        }
    }
}

/// What a tick did.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub reaped: usize,
    pub rearmed: Vec<String>,
    pub enqueued: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

pub struct Scheduler {
    queue: JobQueue,
    settings: SchedulerSettings,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(queue: JobQueue, settings: SchedulerSettings) -> Self {
        Self {
            queue,
            settings,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn tick(&self) -> Result<TickReport, QueueError> {
        self.tick_at(Utc::now())
    }

    /// Runs one scheduling pass as of `now`.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, QueueError> {
        let span = tracing::info_span!("scheduler_tick");
        let _enter = span.enter();

        let mut report = TickReport {
            reaped: self.queue.reap_expired_leases(now)?.len(),
            ..Default::default()
        };

        let stale_before = now
            - chrono::Duration::from_std(self.settings.rescan_stale_after)
                .unwrap_or_else(|_| chrono::Duration::hours(6));
        report.rearmed = self
            .queue
            .database()
            .with_conn(|conn| target_repo::rearm_stale(conn, &format_timestamp(stale_before)))?;
        for target_id in &report.rearmed {
            log::warn!("Re-armed stale rescan flag on target {}", target_id);
        }

        let candidates = self
            .queue
            .database()
            .with_conn(target_repo::list_schedulable)?;

        for target in candidates {
            let Some(schedule) = ScanSchedule::parse(&target.scan_schedule) else {
                log::warn!(
                    "Target {} has unknown schedule '{}', skipping",
                    target.id,
                    target.scan_schedule
                );
                continue;
            };
            let last = target.last_discovered_at.as_deref().map(parse_timestamp);
            if !schedule.is_due(last, now) {
                continue;
            }

            match self.claim(&target.id, report.run_id.as_deref(), true, now) {
                Ok(Some((job_id, run))) => {
                    log::info!("Scheduled rescan of target {} as job {}", target.id, job_id);
                    if let Some(run) = run {
                        report.run_id = Some(run.id);
                    }
                    report.enqueued.push(job_id);
                }
                Ok(None) => {
                    log::debug!("Target {} was claimed elsewhere", target.id);
                }
                Err(e) => {
                    log::error!("Failed to schedule rescan of target {}: {}", target.id, e);
                }
            }
        }

        if report.reaped > 0 || !report.enqueued.is_empty() {
            log::info!(
                "Scheduler tick: {} reaped, {} re-armed, {} enqueued",
                report.reaped,
                report.rearmed.len(),
                report.enqueued.len()
            );
        }
        Ok(report)
    }

    /// User-initiated rescan. Returns the job ID, or `None` when a scan of
    /// the target is already in flight.
    pub fn request_rescan(&self, target_id: &str) -> Result<Option<String>, QueueError> {
        let exists = self
            .queue
            .database()
            .with_conn(|conn| target_repo::find(conn, target_id))?
            .is_some();
        if !exists {
            return Err(QueueError::NotFound(target_id.to_string()));
        }

        let claimed = self.claim(target_id, None, false, Utc::now())?;
        match claimed {
            Some((job_id, _)) => {
                log::info!("Rescan of target {} requested as job {}", target_id, job_id);
                Ok(Some(job_id))
            }
            None => Ok(None),
        }
    }

    /// Flips the target to scanning and enqueues its job in one
    /// transaction. With `grouped`, the job joins `run_id` or, when that is
    /// `None`, a new scheduled-rescan run.
    fn claim(
        &self,
        target_id: &str,
        run_id: Option<&str>,
        grouped: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<(String, Option<JobHistoryRun>)>, QueueError> {
        let now_str = format_timestamp(now);
        let payload = JobPayload::ScheduledRescan {
            target_id: target_id.to_string(),
        };

        let claimed: Option<(JobRow, Option<JobHistoryRun>)> =
            self.queue.database().with_tx(|tx| -> Result<_, QueueError> {
                if !target_repo::claim_rescan(tx, target_id, &now_str)? {
                    return Ok(None);
                }

                let run_id = if grouped {
                    Some(match run_id {
                        Some(id) => {
                            history_repo::add_jobs(tx, id, 1, &now_str)?;
                            id.to_string()
                        }
                        None => {
                            let id = uuid::Uuid::new_v4().to_string();
                            history_repo::create(tx, &id, SCHEDULED_RESCAN_WORKFLOW, 1, &now_str)?;
                            id
                        }
                    })
                } else {
                    None
                };

                let row = queue::insert_job(
                    tx,
                    RESCANS_QUEUE,
                    &payload,
                    self.settings.max_attempts,
                    run_id.as_deref(),
                    now,
                )?;
                let run = match run_id {
                    Some(ref id) => history_repo::find(tx, id)?
                        .as_ref()
                        .map(JobHistoryRun::from_row),
                    None => None,
                };
                Ok(Some((row, run)))
            })?;

        Ok(claimed.map(|(row, run)| {
            self.queue.announce_enqueued(&row, run.clone());
            (row.id, run)
        }))
    }

    /// Starts the tick loop on a background thread. A message on
    /// `trigger_rx` runs a tick immediately.
    pub fn start(
        &self,
        mut trigger_rx: broadcast::Receiver<()>,
    ) -> std::io::Result<JoinHandle<()>> {
        let scheduler = Scheduler {
            queue: self.queue.clone(),
            settings: self.settings.clone(),
            shutdown: Arc::clone(&self.shutdown),
        };
        let interval = self.settings.tick_interval;

        std::thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::error!("Failed to start scheduler runtime: {}", e);
                        return;
                    }
                };

                rt.block_on(async {
                    let mut interval_timer = tokio::time::interval(interval);

                    loop {
                        if scheduler.shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        tokio::select! {
                            _ = interval_timer.tick() => {},
                            Ok(()) = trigger_rx.recv() => {
                                log::info!("Manual scheduler tick triggered");
                            },
                        }

                        if scheduler.shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        if let Err(e) = scheduler.tick() {
                            log::error!("Scheduler tick failed: {}", e);
                        }
                    }
                });
                log::info!("Scheduler stopped");
            })
    }

    /// Signals the tick loop to stop after its current pass.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
