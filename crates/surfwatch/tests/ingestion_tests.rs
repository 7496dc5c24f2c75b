//! Issue numbering under concurrent writers.

mod common;

use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use common::{TestHarness, WORKSPACE_ID};
use surfwatch::{CreateIssueInput, IngestionPipeline};

fn input(title: String) -> CreateIssueInput {
    CreateIssueInput {
        title,
        description: Some("details".to_string()),
        tags: Vec::new(),
    }
}

#[test]
fn test_concurrent_ingestions_fill_the_next_numbers() {
    let harness = TestHarness::new();
    let seed = IngestionPipeline::new(harness.connect());
    for i in 0..3 {
        seed.ingest(&input(format!("seed {}", i)), WORKSPACE_ID, "u")
            .unwrap();
    }

    let k: u32 = 12;
    let barrier = Arc::new(Barrier::new(k as usize));
    let handles: Vec<_> = (0..k)
        .map(|i| {
            let pipeline =
                IngestionPipeline::new(harness.connect()).with_retry(100, Duration::from_millis(2));
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                pipeline
                    .ingest(&input(format!("race {}", i)), WORKSPACE_ID, "u")
                    .unwrap()
                    .no
            })
        })
        .collect();

    let numbers: BTreeSet<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(numbers, (4..4 + k).collect::<BTreeSet<u32>>());

    let all = seed.list_issues(WORKSPACE_ID).unwrap();
    assert_eq!(all.len(), 3 + k as usize);
    assert!(all.windows(2).all(|w| w[1].no == w[0].no + 1));
}
