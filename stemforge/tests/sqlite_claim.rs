//! Concurrent claims against the SQLite queue.

mod common;

use std::sync::Arc;

use common::TestEnv;
use dashmap::DashSet;
use stemforge::domain::{JobOptions, QueueState, StageJob, StageKind};
use tokio::task::JoinSet;

const JOBS: usize = 40;
const CLAIMERS: usize = 8;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_job_claimed_exactly_once() {
    let env = TestEnv::new().await;
    let manager = env.manager();
    let queue = manager.queue().clone();

    for i in 0..JOBS {
        queue
            .enqueue(StageJob::new(
                StageKind::Analysis,
                format!("track-{i}"),
                JobOptions::new(),
            ))
            .await
            .unwrap();
    }

    let claimed: Arc<DashSet<String>> = Arc::new(DashSet::new());
    let mut tasks = JoinSet::new();
    for _ in 0..CLAIMERS {
        let queue = queue.clone();
        let claimed = claimed.clone();
        tasks.spawn(async move {
            let mut duplicates = 0;
            while let Some(mut job) = queue.claim(StageKind::Analysis).await.unwrap() {
                assert_eq!(job.entry.state, QueueState::Executing);
                assert_eq!(job.entry.attempt, 1);
                if !claimed.insert(job.job.id.clone()) {
                    duplicates += 1;
                }
                queue.complete(&mut job.entry).await.unwrap();
            }
            duplicates
        });
    }

    while let Some(result) = tasks.join_next().await {
        assert_eq!(result.unwrap(), 0);
    }
    assert_eq!(claimed.len(), JOBS);
    assert_eq!(queue.depth(StageKind::Analysis).await.unwrap(), 0);
    // Processing has its own lane.
    assert!(queue.claim(StageKind::Processing).await.unwrap().is_none());
}
