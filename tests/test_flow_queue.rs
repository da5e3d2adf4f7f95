//! Integration tests for the job queue / flow orchestrator.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use async_trait::async_trait;

use annopipe::flow::{
    ChildOutcome, HandlerRegistry, JobContext, JobHandler, JobQueue, JobSpec, JobState, RetryPolicy,
};

/// Returns its own payload.
struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    fn job_name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Return the job payload"
    }
    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value> {
        Ok(ctx.data().clone())
    }
}

/// Fails the first `failures` attempts, then succeeds.
struct FlakyHandler {
    failures: AtomicU32,
}

#[async_trait]
impl JobHandler for FlakyHandler {
    fn job_name(&self) -> &str {
        "flaky"
    }
    fn description(&self) -> &str {
        "Fail a configured number of attempts"
    }
    async fn run(&self, _ctx: JobContext) -> Result<serde_json::Value> {
        if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("transient failure");
        }
        Ok(serde_json::json!({ "recovered": true }))
    }
}

/// Always fails.
struct BoomHandler;

#[async_trait]
impl JobHandler for BoomHandler {
    fn job_name(&self) -> &str {
        "boom"
    }
    fn description(&self) -> &str {
        "Always fail"
    }
    async fn run(&self, _ctx: JobContext) -> Result<serde_json::Value> {
        anyhow::bail!("boom")
    }
}

/// Parent handler: returns its children's outcomes verbatim.
struct CollectHandler;

#[async_trait]
impl JobHandler for CollectHandler {
    fn job_name(&self) -> &str {
        "collect"
    }
    fn description(&self) -> &str {
        "Collect child outcomes"
    }
    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(ctx.children_values())?)
    }
}

fn queue_with_handlers(flaky_failures: u32) -> Arc<JobQueue> {
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(EchoHandler));
    handlers.register(Arc::new(FlakyHandler {
        failures: AtomicU32::new(flaky_failures),
    }));
    handlers.register(Arc::new(BoomHandler));
    handlers.register(Arc::new(CollectHandler));

    let queue = JobQueue::new();
    queue.start_workers(Arc::new(handlers), Some(4));
    queue
}

#[test]
fn handler_registry_lists_sorted_entries() {
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(FlakyHandler {
        failures: AtomicU32::new(0),
    }));
    handlers.register(Arc::new(EchoHandler));

    let entries = handlers.list();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0], ("echo", "Return the job payload"));
    assert_eq!(entries[1], ("flaky", "Fail a configured number of attempts"));
}

#[tokio::test]
async fn single_job_completes_with_return_value() {
    let queue = queue_with_handlers(0);

    let id = queue
        .add_job(JobSpec::new(
            "echo",
            "test",
            serde_json::json!({ "x": 42 }),
        ))
        .unwrap();
    let job = queue.wait_until_terminal(&id).await.unwrap();

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.return_value, Some(serde_json::json!({ "x": 42 })));
    assert_eq!(job.attempts_made, 1);
    assert!(job.finished.is_some());
}

#[tokio::test]
async fn unregistered_job_name_fails() {
    let queue = queue_with_handlers(0);

    let id = queue
        .add_job(JobSpec::new("nonsense", "test", serde_json::json!({})))
        .unwrap();
    let job = queue.wait_until_terminal(&id).await.unwrap();

    assert_eq!(job.state, JobState::Failed);
    assert!(job.failure_reason.unwrap().contains("No handler"));
}

#[tokio::test]
async fn failed_attempts_are_retried_until_success() {
    let queue = queue_with_handlers(1);

    let id = queue
        .add_job(
            JobSpec::new("flaky", "test", serde_json::json!({}))
                .with_opts(RetryPolicy::exponential(3, 10)),
        )
        .unwrap();
    let job = queue.wait_until_terminal(&id).await.unwrap();

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts_made, 2);
    assert_eq!(job.return_value, Some(serde_json::json!({ "recovered": true })));
}

#[tokio::test]
async fn exhausted_attempts_fail_permanently() {
    let queue = queue_with_handlers(0);

    let id = queue
        .add_job(
            JobSpec::new("boom", "test", serde_json::json!({}))
                .with_opts(RetryPolicy::exponential(2, 10)),
        )
        .unwrap();
    let job = queue.wait_until_terminal(&id).await.unwrap();

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 2);
    assert!(job.failure_reason.unwrap().contains("boom"));
}

#[tokio::test]
async fn flow_parent_waits_for_children() {
    let queue = queue_with_handlers(0);

    let mut spec = JobSpec::new("collect", "test", serde_json::json!({}));
    for i in 0..3 {
        spec = spec.child(JobSpec::new("echo", "test", serde_json::json!({ "i": i })));
    }
    let root = queue.add_flow(spec).unwrap();

    // The parent is parked in waiting-children immediately after enqueue.
    let parked = queue.get_job(&root).unwrap();
    assert!(matches!(
        parked.state,
        JobState::WaitingChildren | JobState::Waiting | JobState::Active | JobState::Completed
    ));

    let job = queue.wait_until_terminal(&root).await.unwrap();
    assert_eq!(job.state, JobState::Completed);

    // Child outcomes arrive in registration order.
    let outcomes: Vec<ChildOutcome> = serde_json::from_value(job.return_value.unwrap()).unwrap();
    assert_eq!(outcomes.len(), 3);
    for (i, outcome) in outcomes.iter().enumerate() {
        match outcome {
            ChildOutcome::Ok { value } => {
                assert_eq!(value["i"], serde_json::json!(i));
            }
            ChildOutcome::Errored { reason } => panic!("Unexpected failure: {}", reason),
        }
    }
}

#[tokio::test]
async fn parent_observes_failed_children_as_errored_outcomes() {
    let queue = queue_with_handlers(0);

    let spec = JobSpec::new("collect", "test", serde_json::json!({}))
        .child(JobSpec::new("echo", "test", serde_json::json!({ "i": 0 })))
        .child(JobSpec::new("boom", "test", serde_json::json!({})));
    let root = queue.add_flow(spec).unwrap();

    let job = queue.wait_until_terminal(&root).await.unwrap();

    // The parent itself completes — child failure surfaces as a value.
    assert_eq!(job.state, JobState::Completed);
    let outcomes: Vec<ChildOutcome> = serde_json::from_value(job.return_value.unwrap()).unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(!outcomes[0].is_errored());
    assert!(outcomes[1].is_errored());
}

#[tokio::test]
async fn parent_state_is_waiting_children_before_workers_start() {
    // No workers: the tree stays parked exactly as enqueued.
    let queue = JobQueue::new();

    let spec = JobSpec::new("collect", "test", serde_json::json!({}))
        .child(JobSpec::new("echo", "test", serde_json::json!({})));
    let root = queue.add_flow(spec).unwrap();

    let parent = queue.get_job(&root).unwrap();
    assert_eq!(parent.state, JobState::WaitingChildren);
    assert_eq!(parent.children.len(), 1);

    let child = queue.get_job(&parent.children[0]).unwrap();
    assert_eq!(child.state, JobState::Waiting);
    assert_eq!(child.parent, Some(root));
}
