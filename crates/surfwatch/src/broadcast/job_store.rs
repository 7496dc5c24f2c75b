//! Dashboard-facing job view: latest event per job in memory, history from
//! the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;

use super::job_events::{JobEvent, JobEventBroadcaster};
use crate::db::job_repo::JobFilter;
use crate::error::QueueError;
use crate::queue::{Job, JobCounts, JobQueue, JobStatus};

/// Query parameters for job listing.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobQueryParams {
    pub status: Option<String>,
    pub queue_name: Option<String>,
    pub run_id: Option<String>,
    pub target_id: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Response for job listing with pagination.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

// ─── JobStore ───────────────────────────────────────────────────────────────

/// Job state for a dashboard.
///
/// The cache only holds the last event seen for each job; anything older
/// or paginated is answered from the store through the queue.
pub struct JobStore {
    queue: JobQueue,
    cache: RwLock<HashMap<String, JobEvent>>,
    /// Terminal entries kept in the cache before the oldest are dropped.
    max_finished: usize,
    shutdown: AtomicBool,
    stop: Notify,
}

impl JobStore {
    pub fn new(queue: JobQueue, max_finished: usize) -> Self {
        Self {
            queue,
            cache: RwLock::new(HashMap::new()),
            max_finished,
            shutdown: AtomicBool::new(false),
            stop: Notify::new(),
        }
    }

    /// Records an event as the latest state of its job. A removal drops the
    /// job from the cache.
    pub fn update(&self, event: &JobEvent) {
        let mut cache = match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        if event.removed {
            cache.remove(&event.job_id);
            return;
        }
        cache.insert(event.job_id.clone(), event.clone());

        let finished = cache.values().filter(|e| e.status.is_terminal()).count();
        if finished > self.max_finished {
            let mut terminal: Vec<(String, chrono::DateTime<chrono::Utc>)> = cache
                .values()
                .filter(|e| e.status.is_terminal())
                .map(|e| (e.job_id.clone(), e.timestamp))
                .collect();
            terminal.sort_by(|a, b| a.1.cmp(&b.1));
            for (job_id, _) in terminal.into_iter().take(finished - self.max_finished) {
                cache.remove(&job_id);
            }
        }
    }

    /// Latest cached event for a job.
    pub fn latest(&self, job_id: &str) -> Option<JobEvent> {
        let cache = match self.cache.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        cache.get(job_id).cloned()
    }

    /// Jobs currently held by a worker, per the cache.
    pub fn in_flight(&self) -> Vec<JobEvent> {
        let cache = match self.cache.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let mut events: Vec<JobEvent> = cache
            .values()
            .filter(|e| e.status == JobStatus::InProgress)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events
    }

    /// Query jobs with filters and pagination.
    pub fn query(&self, params: &JobQueryParams) -> Result<JobListResponse, QueueError> {
        let filter = JobFilter {
            status: params.status.clone(),
            queue_name: params.queue_name.clone(),
            run_id: params.run_id.clone(),
            target_id: params.target_id.clone(),
            limit: params.limit,
            offset: params.offset,
        };
        let (jobs, total) = self.queue.query(&filter)?;
        Ok(JobListResponse {
            jobs,
            total,
            limit: params.limit,
            offset: params.offset,
        })
    }

    pub fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        self.queue.get(job_id)
    }

    pub fn counts(&self) -> Result<JobCounts, QueueError> {
        self.queue.counts()
    }

    /// Feeds every event from `broadcaster` into the cache on a background
    /// thread. The thread ends on [`JobStore::stop`] or when the broadcaster
    /// is dropped.
    pub fn follow(
        self: &Arc<Self>,
        broadcaster: &JobEventBroadcaster,
    ) -> std::io::Result<JoinHandle<()>> {
        let mut rx = broadcaster.subscribe();
        let store = Arc::clone(self);
        std::thread::Builder::new()
            .name("job-store".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::error!("Failed to start job store runtime: {}", e);
                        return;
                    }
                };

                rt.block_on(async {
                    while !store.shutdown.load(Ordering::Acquire) {
                        tokio::select! {
                            _ = store.stop.notified() => break,
                            received = rx.recv() => match received {
                                Ok(event) => store.update(&event),
                                Err(RecvError::Lagged(skipped)) => {
                                    log::warn!("Job store fell behind, skipped {} events", skipped);
                                }
                                Err(RecvError::Closed) => break,
                            },
                        }
                    }
                });
                log::debug!("Job store follower stopped");
            })
    }

    /// Stops the thread started by [`JobStore::follow`].
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.stop.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::queue::{JobPayload, ToolInvocation, TOOLS_QUEUE};

    fn store(max_finished: usize) -> (JobQueue, JobStore) {
        let db = Database::open_in_memory().unwrap();
        let queue = JobQueue::new(db, JobEventBroadcaster::new(64));
        let store = JobStore::new(queue.clone(), max_finished);
        (queue, store)
    }

    fn payload() -> JobPayload {
        JobPayload::ToolRun(ToolInvocation {
            tool_id: "probe".to_string(),
            ..Default::default()
        })
    }

    fn drain(store: &JobStore, rx: &mut tokio::sync::broadcast::Receiver<JobEvent>) {
        while let Ok(event) = rx.try_recv() {
            store.update(&event);
        }
    }

    #[test]
    fn test_latest_tracks_transitions() {
        let (queue, store) = store(10);
        let mut rx = queue.events().subscribe();

        let id = queue.enqueue(TOOLS_QUEUE, &payload(), 1).unwrap();
        queue.lease(TOOLS_QUEUE, "w").unwrap();
        drain(&store, &mut rx);
        assert_eq!(store.latest(&id).unwrap().status, JobStatus::InProgress);
        assert_eq!(store.in_flight().len(), 1);

        queue.complete(&id, "w", None).unwrap();
        drain(&store, &mut rx);
        assert_eq!(store.latest(&id).unwrap().status, JobStatus::Completed);
        assert!(store.in_flight().is_empty());
    }

    #[test]
    fn test_finished_entries_are_evicted() {
        let (queue, store) = store(1);
        let mut rx = queue.events().subscribe();

        let first = queue.enqueue(TOOLS_QUEUE, &payload(), 1).unwrap();
        let second = queue.enqueue(TOOLS_QUEUE, &payload(), 1).unwrap();
        for id in [&first, &second] {
            queue.lease(TOOLS_QUEUE, "w").unwrap();
            queue.complete(id, "w", None).unwrap();
        }
        drain(&store, &mut rx);

        assert!(store.latest(&first).is_none());
        assert!(store.latest(&second).is_some());
        // Evicted jobs are still answered from the store.
        assert!(store.get(&first).unwrap().is_some());
    }

    #[test]
    fn test_query_paginates_from_store() {
        let (queue, store) = store(10);
        for _ in 0..3 {
            queue.enqueue(TOOLS_QUEUE, &payload(), 1).unwrap();
        }
        let response = store
            .query(&JobQueryParams {
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(response.total, 3);
        assert_eq!(response.jobs.len(), 2);
        assert_eq!(store.counts().unwrap().queued, 3);
    }

    #[test]
    fn test_removed_job_leaves_cache() {
        let (queue, store) = store(10);
        let mut rx = queue.events().subscribe();

        let id = queue.enqueue(TOOLS_QUEUE, &payload(), 1).unwrap();
        drain(&store, &mut rx);
        assert_eq!(store.latest(&id).unwrap().status, JobStatus::Queued);

        queue.remove(&id).unwrap();
        drain(&store, &mut rx);
        assert!(store.latest(&id).is_none());
        assert!(store.get(&id).unwrap().is_none());
    }

    #[test]
    fn test_stop_ends_follower_while_queue_alive() {
        let (queue, store) = store(10);
        let store = Arc::new(store);
        let handle = store.follow(queue.events()).unwrap();

        let id = queue.enqueue(TOOLS_QUEUE, &payload(), 1).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while store.latest(&id).is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(store.latest(&id).is_some());

        store.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_follow_stops_when_broadcaster_dropped() {
        let (queue, store) = store(10);
        let store = Arc::new(store);
        let broadcaster = JobEventBroadcaster::new(8);
        let handle = store.follow(&broadcaster).unwrap();

        let id = queue.enqueue(TOOLS_QUEUE, &payload(), 1).unwrap();
        let job = queue.get(&id).unwrap().unwrap();
        broadcaster.send(JobEvent::from_job(&job, None));
        drop(broadcaster);
        handle.join().unwrap();

        assert_eq!(store.latest(&id).unwrap().status, JobStatus::Queued);
    }
}
