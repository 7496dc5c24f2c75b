//! Job event broadcaster for dashboard streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::queue::{Job, JobHistoryRun, JobStatus};

/// A job state transition.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: String,
    pub queue_name: String,
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_name: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Aggregate of the owning run after this transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<JobHistoryRun>,
    /// The job row was deleted; `status` is the last one it had.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub removed: bool,
}

impl JobEvent {
    /// Builds an event describing the job's current state.
    pub fn from_job(job: &Job, run: Option<JobHistoryRun>) -> Self {
        Self {
            job_id: job.id.clone(),
            queue_name: job.queue_name.clone(),
            status: job.status,
            timestamp: Utc::now(),
            worker_name: job.worker_name.clone(),
            attempts: job.attempts,
            error: job.error.clone(),
            run,
            removed: false,
        }
    }

    /// Announces that a job was deleted from its queue.
    pub fn removed(job: &Job, run: Option<JobHistoryRun>) -> Self {
        Self {
            removed: true,
            ..Self::from_job(job, run)
        }
    }
}

/// Broadcasts job events to every subscriber.
#[derive(Clone)]
pub struct JobEventBroadcaster {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl JobEventBroadcaster {
    /// Creates a broadcaster with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: JobEvent) {
        // No active receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
