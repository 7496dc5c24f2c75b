//! Test harness over a temporary on-disk database.
//!
//! Every `Database::open` on the harness path is a separate SQLite
//! connection, which is how separate processes see the store.

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use surfwatch::broadcast::JobEventBroadcaster;
use surfwatch::db::target_repo::{self, TargetRow};
use surfwatch::db::Database;
use surfwatch::{Job, JobQueue};

pub const WORKSPACE_ID: &str = "ws-test";

pub struct TestHarness {
    /// Keeps the directory alive for the harness lifetime.
    _temp_dir: TempDir,
    pub db_path: PathBuf,
    pub db: Database,
}

impl TestHarness {
    /// Creates a fresh store with one workspace.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("data").join("surfwatch.db");
        let db = Database::open(&db_path).expect("Failed to open database");
        db.with_conn(|conn| {
            target_repo::insert_workspace(conn, WORKSPACE_ID, "Test", "2026-01-01T00:00:00.000000Z")
        })
        .expect("Failed to create workspace");

        Self {
            _temp_dir: temp_dir,
            db_path,
            db,
        }
    }

    /// Opens another connection to the same store.
    pub fn connect(&self) -> Database {
        Database::open(&self.db_path).expect("Failed to reopen database")
    }

    /// A queue over a new connection.
    pub fn queue(&self) -> JobQueue {
        JobQueue::new(self.connect(), JobEventBroadcaster::default())
    }

    pub fn add_target(&self, target: &TargetRow) {
        self.db
            .with_conn(|conn| target_repo::insert(conn, WORKSPACE_ID, target))
            .expect("Failed to insert target");
    }

    pub fn target(&self, id: &str) -> TargetRow {
        self.db
            .with_conn(|conn| target_repo::find(conn, id))
            .expect("Failed to load target")
            .expect("Target not found")
    }

    /// Polls until the job reaches a terminal status or `timeout` passes.
    pub fn wait_terminal(&self, queue: &JobQueue, job_id: &str, timeout: Duration) -> Job {
        let deadline = Instant::now() + timeout;
        loop {
            let job = queue
                .get(job_id)
                .expect("Failed to load job")
                .expect("Job not found");
            if job.status.is_terminal() || Instant::now() > deadline {
                return job;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
