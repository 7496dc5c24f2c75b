//! Wires the queue, worker pools, scheduler and job store together from a
//! loaded configuration.

use std::sync::Arc;
use std::thread::JoinHandle;

use log::{error, info, warn};
use tokio::sync::broadcast;

use crate::broadcast::{JobEventBroadcaster, JobStore};
use crate::config::Config;
use crate::db::Database;
use crate::error::{ConfigError, IngestError, Result};
use crate::ingest::IngestionPipeline;
use crate::queue::{
    CreateIssueInput, JobPayload, JobQueue, ToolInvocation, ISSUES_QUEUE, RESCANS_QUEUE,
    TOOLS_QUEUE,
};
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::tool::{ProcessRunner, ToolCatalog};
use crate::worker::{check_invocation, Dispatcher, PoolConfig, WorkerPool};

/// Finished jobs kept in the in-memory job view.
const JOB_STORE_CAPACITY: usize = 1_000;

pub struct Orchestrator {
    config: Config,
    queue: JobQueue,
    catalog: Arc<ToolCatalog>,
    ingestion: IngestionPipeline,
    scheduler: Scheduler,
    job_store: Arc<JobStore>,
    trigger_tx: broadcast::Sender<()>,
    pools: Vec<WorkerPool>,
    scheduler_handle: Option<JoinHandle<()>>,
    job_store_handle: Option<JoinHandle<()>>,
}

impl Orchestrator {
    /// Opens the configured store and builds every component. Nothing runs
    /// until [`Orchestrator::start`].
    pub fn open(config: Config) -> Result<Self> {
        let path = config.database_path().ok_or_else(|| ConfigError::Validation {
            message: "No database path configured and no home directory found".to_string(),
        })?;
        let db = Database::open(&path)?;
        Self::with_database(config, db)
    }

    pub fn with_database(config: Config, db: Database) -> Result<Self> {
        let catalog = Arc::new(ToolCatalog::new(config.tools.clone())?);

        let mut queue = JobQueue::new(db.clone(), JobEventBroadcaster::default())
            .with_lease_duration(config.scheduler.lease_duration());
        for resolved in config.resolved_queues() {
            queue = queue.with_backoff(&resolved.name, resolved.backoff);
        }

        let scheduler = Scheduler::new(
            queue.clone(),
            SchedulerSettings {
                tick_interval: config.scheduler.tick_interval(),
                rescan_stale_after: config.scheduler.rescan_stale_after(),
                max_attempts: config.queue(RESCANS_QUEUE).max_attempts,
            },
        );
        let job_store = Arc::new(JobStore::new(queue.clone(), JOB_STORE_CAPACITY));
        let (trigger_tx, _) = broadcast::channel(16);

        Ok(Self {
            ingestion: IngestionPipeline::new(db),
            config,
            queue,
            catalog,
            scheduler,
            job_store,
            trigger_tx,
            pools: Vec::new(),
            scheduler_handle: None,
            job_store_handle: None,
        })
    }

    /// Starts one worker pool per queue, the scheduler thread and the job
    /// view. Calling it twice is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if !self.pools.is_empty() {
            warn!("Orchestrator already started");
            return Ok(());
        }

        let handle = self
            .job_store
            .follow(self.queue.events())
            .map_err(|e| crate::error::WorkerError::SpawnFailed(e.to_string()))?;
        self.job_store_handle = Some(handle);

        let dispatcher = Arc::new(Dispatcher::new(
            self.queue.clone(),
            Arc::clone(&self.catalog),
            ProcessRunner::new(self.config.shell.clone()),
            self.ingestion.clone(),
            self.config.scheduler.rescan_tools.clone(),
        ));

        for resolved in self.config.resolved_queues() {
            let pool = WorkerPool::start(
                self.queue.clone(),
                Arc::clone(&dispatcher),
                PoolConfig {
                    queue_name: resolved.name,
                    concurrency: resolved.concurrency,
                    poll_interval: resolved.poll_interval,
                },
            );
            match pool {
                Ok(pool) => self.pools.push(pool),
                Err(e) => {
                    self.stop_pools();
                    self.stop_job_store();
                    return Err(e.into());
                }
            }
        }

        match self.scheduler.start(self.trigger_tx.subscribe()) {
            Ok(handle) => self.scheduler_handle = Some(handle),
            Err(e) => {
                self.stop_pools();
                self.stop_job_store();
                return Err(crate::error::WorkerError::SpawnFailed(e.to_string()).into());
            }
        }

        info!(
            "Orchestrator started: {} pools, {} tools, tick every {:?}",
            self.pools.len(),
            self.catalog.len(),
            self.config.scheduler.tick_interval()
        );
        Ok(())
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn job_store(&self) -> &Arc<JobStore> {
        &self.job_store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn ingestion(&self) -> &IngestionPipeline {
        &self.ingestion
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Enqueues a tool run after checking it binds. Configuration errors
    /// are returned here rather than showing up as a failed job.
    pub fn submit_tool_run(&self, invocation: ToolInvocation) -> Result<String> {
        check_invocation(&self.catalog, &invocation)?;
        let max_attempts = self.config.queue(TOOLS_QUEUE).max_attempts;
        Ok(self
            .queue
            .enqueue(TOOLS_QUEUE, &JobPayload::ToolRun(invocation), max_attempts)?)
    }

    /// Enqueues several tool runs as one tracked run.
    pub fn submit_tool_batch(
        &self,
        workflow_name: &str,
        invocations: Vec<ToolInvocation>,
    ) -> Result<(String, Vec<String>)> {
        for invocation in &invocations {
            check_invocation(&self.catalog, invocation)?;
        }
        let payloads: Vec<JobPayload> = invocations.into_iter().map(JobPayload::ToolRun).collect();
        let max_attempts = self.config.queue(TOOLS_QUEUE).max_attempts;
        Ok(self
            .queue
            .enqueue_batch(workflow_name, TOOLS_QUEUE, &payloads, max_attempts)?)
    }

    pub fn submit_issue(
        &self,
        workspace_id: &str,
        user_id: &str,
        input: CreateIssueInput,
    ) -> Result<String> {
        if input.title.trim().is_empty() {
            return Err(IngestError::EmptyTitle.into());
        }
        let payload = JobPayload::CreateIssue {
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
            input,
        };
        let max_attempts = self.config.queue(ISSUES_QUEUE).max_attempts;
        Ok(self.queue.enqueue(ISSUES_QUEUE, &payload, max_attempts)?)
    }

    /// User-initiated rescan. `None` when one is already in flight.
    pub fn request_rescan(&self, target_id: &str) -> Result<Option<String>> {
        Ok(self.scheduler.request_rescan(target_id)?)
    }

    /// Runs a scheduler tick now instead of waiting for the interval.
    pub fn trigger_tick(&self) {
        if self.trigger_tx.send(()).is_err() {
            warn!("Scheduler is not running; tick trigger dropped");
        }
    }

    /// Stops the scheduler and all pools, waiting for in-flight jobs.
    pub fn shutdown(mut self) {
        info!("Shutting down orchestrator...");
        self.scheduler.stop();
        let _ = self.trigger_tx.send(());
        if let Some(handle) = self.scheduler_handle.take() {
            if handle.join().is_err() {
                error!("Scheduler thread panicked");
            }
        }
        self.stop_pools();
        self.stop_job_store();
        info!("Orchestrator stopped");
    }

    fn stop_job_store(&mut self) {
        self.job_store.stop();
        if let Some(handle) = self.job_store_handle.take() {
            if handle.join().is_err() {
                error!("Job store thread panicked");
            }
        }
    }

    fn stop_pools(&mut self) {
        for pool in &self.pools {
            pool.shutdown();
        }
        for pool in self.pools.drain(..) {
            pool.wait();
        }
    }
}
