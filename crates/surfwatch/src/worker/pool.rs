use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info};

use crate::error::WorkerError;
use crate::queue::JobQueue;
use crate::worker::dispatch::Dispatcher;

/// Sizing and polling for one queue's pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub queue_name: String,
    pub concurrency: usize,
    /// Longest an idle worker sleeps before checking the queue again.
    pub poll_interval: Duration,
}

/// Worker threads leasing from one queue.
pub struct WorkerPool {
    queue_name: String,
    worker_names: Vec<String>,
    workers: Vec<JoinHandle<()>>,
    wake_sender: Sender<()>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawns `concurrency` workers named `"{queue}-{pid}-{index}"`.
    pub fn start(
        queue: JobQueue,
        dispatcher: Arc<Dispatcher>,
        config: PoolConfig,
    ) -> Result<Self, WorkerError> {
        if config.concurrency == 0 {
            return Err(WorkerError::SpawnFailed(format!(
                "pool for '{}' needs at least one worker",
                config.queue_name
            )));
        }

        let (wake_sender, wake_receiver) = bounded::<()>(config.concurrency);
        queue.register_waker(&config.queue_name, wake_sender.clone());
        let shutdown = Arc::new(AtomicBool::new(false));

        let pid = std::process::id();
        let mut workers = Vec::with_capacity(config.concurrency);
        let mut worker_names = Vec::with_capacity(config.concurrency);

        for index in 0..config.concurrency {
            let worker_name = format!("{}-{}-{}", config.queue_name, pid, index);
            let worker = Worker {
                name: worker_name.clone(),
                queue_name: config.queue_name.clone(),
                queue: queue.clone(),
                dispatcher: Arc::clone(&dispatcher),
                wake: wake_receiver.clone(),
                shutdown: Arc::clone(&shutdown),
                poll_interval: config.poll_interval,
            };

            let spawned = thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => {
                    workers.push(handle);
                    worker_names.push(worker_name);
                }
                Err(e) => {
                    // Stop whatever already started before bailing out.
                    shutdown.store(true, Ordering::Relaxed);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(WorkerError::SpawnFailed(e.to_string()));
                }
            }
        }

        info!(
            "Started {} workers on queue '{}'",
            config.concurrency, config.queue_name
        );

        Ok(Self {
            queue_name: config.queue_name,
            worker_names,
            workers,
            wake_sender,
            shutdown,
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn worker_names(&self) -> &[String] {
        &self.worker_names
    }

    /// Wakes idle workers so they lease right away.
    pub fn wake(&self) {
        let _ = self.wake_sender.try_send(());
    }

    /// Asks workers to stop after their current job.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool '{}'...", self.queue_name);
        self.shutdown.store(true, Ordering::Relaxed);
        for _ in 0..self.workers.len() {
            if self.wake_sender.try_send(()).is_err() {
                break;
            }
        }
    }

    pub fn wait(self) {
        for (name, worker) in self.worker_names.iter().zip(self.workers) {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", name, e);
            } else {
                debug!("Worker {} finished", name);
            }
        }

        info!("All workers on '{}' have stopped", self.queue_name);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

struct Worker {
    name: String,
    queue_name: String,
    queue: JobQueue,
    dispatcher: Arc<Dispatcher>,
    wake: Receiver<()>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl Worker {
    fn run(self) {
        debug!("Worker {} started", self.name);

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                debug!("Worker {} received shutdown signal", self.name);
                break;
            }

            match self.queue.lease(&self.queue_name, &self.name) {
                Ok(Some(job)) => {
                    debug!("Worker {} leased job {}", self.name, job.id);
                    self.dispatcher.handle(&job, &self.name);
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!("Worker {} failed to lease: {}", self.name, e),
            }

            match self.wake.recv_timeout(self.poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Worker {} wake channel disconnected", self.name);
                    break;
                }
            }
        }

        debug!("Worker {} stopped", self.name);
    }
}
