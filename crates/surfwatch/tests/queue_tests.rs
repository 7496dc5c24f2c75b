//! Queue behaviour across separate store connections.

mod common;

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use common::{invocation, TestHarness};
use surfwatch::queue::{Backoff, TOOLS_QUEUE};
use surfwatch::{JobPayload, JobStatus};

#[test]
fn test_concurrent_leases_never_share_a_job() {
    let harness = TestHarness::new();
    let producer = harness.queue();
    let mut expected = HashSet::new();
    for i in 0..40 {
        let payload = JobPayload::ToolRun(invocation(&format!("tool-{}", i), &[], &[]));
        expected.insert(producer.enqueue(TOOLS_QUEUE, &payload, 1).unwrap());
    }

    let workers = 4;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|w| {
            let queue = harness.queue();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let name = format!("tools-test-{}", w);
                let mut leased = Vec::new();
                barrier.wait();
                while let Some(job) = queue.lease(TOOLS_QUEUE, &name).unwrap() {
                    assert_eq!(job.worker_name.as_deref(), Some(name.as_str()));
                    leased.push(job.id);
                }
                leased
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.join().unwrap() {
            total += 1;
            assert!(seen.insert(id), "job leased twice");
        }
    }
    assert_eq!(total, 40);
    assert_eq!(seen, expected);
    assert_eq!(producer.counts().unwrap().in_progress, 40);
}

#[test]
fn test_always_failing_job_walks_retry_sequence() {
    let harness = TestHarness::new();
    let queue = harness
        .queue()
        .with_backoff(TOOLS_QUEUE, Backoff::new(Duration::ZERO, Duration::ZERO));
    let mut events = queue.events().subscribe();

    let id = queue
        .enqueue(
            TOOLS_QUEUE,
            &JobPayload::ToolRun(invocation("broken", &[], &[])),
            3,
        )
        .unwrap();

    while let Some(job) = queue.lease(TOOLS_QUEUE, "w").unwrap() {
        queue.fail(&job.id, "w", "exit status 1").unwrap();
    }

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.job_id == id {
            statuses.push(event.status);
        }
    }

    use JobStatus::*;
    assert_eq!(
        statuses,
        vec![Queued, InProgress, Queued, InProgress, Queued, InProgress, Failed]
    );

    let job = queue.get(&id).unwrap().unwrap();
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error.as_deref(), Some("exit status 1"));
}

#[test]
fn test_expired_lease_is_reaped_from_another_connection() {
    let harness = TestHarness::new();
    let worker_queue = harness.queue().with_lease_duration(Duration::ZERO);
    let id = worker_queue
        .enqueue(TOOLS_QUEUE, &JobPayload::ToolRun(invocation("t", &[], &[])), 3)
        .unwrap();
    worker_queue.lease(TOOLS_QUEUE, "crashed").unwrap().unwrap();

    let reaper = harness.queue();
    let reaped = reaper
        .reap_expired_leases(chrono::Utc::now() + chrono::Duration::seconds(1))
        .unwrap();

    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].id, id);
    assert_eq!(reaped[0].status, JobStatus::Queued);
    assert!(worker_queue.complete(&id, "crashed", None).is_err());
}
