mod common;

use common::*;
use evalrun_core::jobs::{Job, LocalQueue, TaskQueue};
use evalrun_core::model::{RunStatus, TestConfiguration};
use evalrun_core::providers::fake::FakeTarget;
use evalrun_core::storage::Persistence;
use std::sync::Arc;

#[tokio::test]
async fn queued_run_completes_with_one_result_per_case() {
    init_tracing();
    let store = store();
    store.save_test_set(&test_set("set", single_turn_cases(4))).unwrap();
    let o = Arc::new(orchestrator(store.clone(), Arc::new(FakeTarget::new("prompt ok"))));
    let queue = LocalQueue::new(Arc::new(o.job_registry()), o.config().max_deliveries);

    let (run, handles) = o
        .dispatch_run(&TestConfiguration::live("cfg", "set", "http://target"), &queue)
        .await
        .unwrap();
    assert_eq!(handles.len(), 5);
    assert_eq!(run.status, RunStatus::Running);

    let report = queue.drain().await;
    assert_eq!(report.handled, 5);
    assert!(report.dead_lettered.is_empty());

    let finished = store.load_test_run(&run.id).unwrap().unwrap();
    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(finished.results.len(), 4);
}

#[tokio::test]
async fn duplicate_delivery_never_appends_twice() {
    let store = store();
    store.save_test_set(&test_set("set", single_turn_cases(2))).unwrap();
    let target = Arc::new(FakeTarget::new("prompt ok"));
    let o = Arc::new(orchestrator(store.clone(), target.clone()));

    let mut run = evalrun_core::model::TestRun::new(
        TestConfiguration::live("cfg", "set", "http://target"),
        vec![],
        2,
    );
    run.status = RunStatus::Running;
    store.save_test_run(&run).unwrap();

    o.handle_case_job(&run.id, 0).await.unwrap();
    let first = store.load_test_results(&run.id).unwrap();
    o.handle_case_job(&run.id, 0).await.unwrap();
    let second = store.load_test_results(&run.id).unwrap();

    assert_eq!(first.len(), 1);
    assert_eq!(second, first);
    assert_eq!(target.calls(), 1);
}

#[tokio::test]
async fn redelivered_jobs_after_completion_are_ignored() {
    let store = store();
    store.save_test_set(&test_set("set", single_turn_cases(3))).unwrap();
    let target = Arc::new(FakeTarget::new("prompt ok"));
    let o = Arc::new(orchestrator(store.clone(), target.clone()));
    let queue = LocalQueue::new(Arc::new(o.job_registry()), 3);

    let (run, _) = o
        .dispatch_run(&TestConfiguration::live("cfg", "set", "http://target"), &queue)
        .await
        .unwrap();
    queue.drain().await;
    assert_eq!(target.calls(), 3);

    let mut dup = Job::execute_case(run.id.clone(), 1);
    dup.deliveries = 1;
    queue.redeliver(dup).unwrap();
    queue.enqueue(Job::execute_case(run.id.clone(), 2)).await.unwrap();
    let report = queue.drain().await;

    assert_eq!(report.handled, 2);
    assert_eq!(target.calls(), 3);
    assert_eq!(store.load_test_results(&run.id).unwrap().len(), 3);
}

#[tokio::test]
async fn finalize_waits_for_open_slots() {
    let store = store();
    store.save_test_set(&test_set("set", single_turn_cases(2))).unwrap();
    let o = Arc::new(orchestrator(store.clone(), Arc::new(FakeTarget::new("prompt ok"))));
    let queue = LocalQueue::new(Arc::new(o.job_registry()), 3);

    let (run, _) = o
        .dispatch_run(&TestConfiguration::live("cfg", "set", "http://target"), &queue)
        .await
        .unwrap();

    // Finalize delivered ahead of the case jobs: redelivered until the slots fill.
    let finalize_first = LocalQueue::new(Arc::new(o.job_registry()), 3);
    finalize_first.enqueue(Job::finalize(run.id.clone())).await.unwrap();
    finalize_first.enqueue(Job::execute_case(run.id.clone(), 0)).await.unwrap();
    finalize_first.enqueue(Job::execute_case(run.id.clone(), 1)).await.unwrap();
    let report = finalize_first.drain().await;

    assert_eq!(report.redelivered, 1);
    assert_eq!(report.handled, 3);
    let finished = store.load_test_run(&run.id).unwrap().unwrap();
    assert_eq!(finished.status, RunStatus::Completed);

    // The original queue's jobs now find a finished run and do nothing.
    let report = queue.drain().await;
    assert_eq!(report.handled, 3);
    assert!(report.dead_lettered.is_empty());
}

#[tokio::test]
async fn unstorable_case_still_lets_the_run_finish() {
    init_tracing();
    let store = FlakyStore::failing_for("case-1");
    store.save_test_set(&test_set("set", single_turn_cases(3))).unwrap();
    let o = Arc::new(orchestrator(store.clone(), Arc::new(FakeTarget::new("prompt ok"))));
    let queue = LocalQueue::new(Arc::new(o.job_registry()), o.config().max_deliveries);

    let (run, _) = o
        .dispatch_run(&TestConfiguration::live("cfg", "set", ENDPOINT), &queue)
        .await
        .unwrap();
    let report = queue.drain().await;

    // The failing case job is dead-lettered; finalize runs on its last delivery.
    assert_eq!(report.dead_lettered.len(), 1);
    assert_eq!(report.dead_lettered[0].case_index, Some(1));
    assert_eq!(report.handled, 3);

    let finished = store.load_test_run(&run.id).unwrap().unwrap();
    assert_eq!(finished.status, RunStatus::Partial);
    assert!(finished.finished_at.is_some());
    assert_eq!(finished.results.len(), 2);
}

#[tokio::test]
async fn cancelled_queued_run_ignores_pending_jobs() {
    let store = store();
    store.save_test_set(&test_set("set", single_turn_cases(3))).unwrap();
    let target = Arc::new(FakeTarget::new("prompt ok"));
    let o = Arc::new(orchestrator(store.clone(), target.clone()));
    let queue = LocalQueue::new(Arc::new(o.job_registry()), 3);

    let (run, _) = o
        .dispatch_run(&TestConfiguration::live("cfg", "set", ENDPOINT), &queue)
        .await
        .unwrap();
    let cancelled = o.cancel_run(&run.id).unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);

    let report = queue.drain().await;
    assert_eq!(report.handled, 4);
    assert!(report.dead_lettered.is_empty());
    assert_eq!(target.calls(), 0);

    let stored = store.load_test_run(&run.id).unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Cancelled);
    assert!(stored.results.is_empty());
}
