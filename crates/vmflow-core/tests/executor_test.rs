// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chain executor behaviour: ordering, retry, poll, timeout, cancellation
//! and recovery chains.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Map;
use vmflow_core::{
    BoxFuture, CancellationToken, Capability, ChainExecutor, ChainKind, ExecutionContext, Job,
    JobStatus, TaskDescriptor, TaskError, TaskOutcome, TaskRegistry, TaskResult,
    WorkflowDefinition,
};

// ============================================================================
// Test context
// ============================================================================

#[derive(Default)]
struct TestCtx {
    log: Mutex<Vec<String>>,
    flaky_failures: AtomicU32,
}

impl TestCtx {
    fn log(&self, entry: &str) {
        self.log.lock().unwrap().push(entry.to_string());
    }

    fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct Scratch {
    polls: u32,
}

impl ExecutionContext for TestCtx {
    type Scratch = Scratch;

    fn provides(&self, _capability: Capability) -> bool {
        true
    }
}

type TestJob = Job<Scratch>;

fn first<'a>(_job: &'a mut TestJob, ctx: &'a TestCtx) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        ctx.log("first");
        Ok(TaskOutcome::done("first done"))
    })
}

fn second<'a>(job: &'a mut TestJob, ctx: &'a TestCtx) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        ctx.log("second");
        job.set_param("second_ran", true);
        Ok(TaskOutcome::done("second done"))
    })
}

fn flaky<'a>(_job: &'a mut TestJob, ctx: &'a TestCtx) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        ctx.log("flaky");
        let remaining = ctx.flaky_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            ctx.flaky_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TaskError::transient("cnapi", "connection refused"));
        }
        Ok(TaskOutcome::done("flaky done"))
    })
}

fn rejected<'a>(_job: &'a mut TestJob, ctx: &'a TestCtx) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        ctx.log("rejected");
        Err(TaskError::Service {
            service: "napi".to_string(),
            status: 422,
            message: "invalid nic".to_string(),
        })
    })
}

fn poll_twice<'a>(job: &'a mut TestJob, ctx: &'a TestCtx) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        ctx.log("poll_twice");
        if job.scratch.polls < 2 {
            job.scratch.polls += 1;
            return Ok(TaskOutcome::poll(Duration::from_millis(5), "still queued"));
        }
        Ok(TaskOutcome::done(format!("done after {} polls", job.scratch.polls)))
    })
}

fn poll_forever<'a>(_job: &'a mut TestJob, _ctx: &'a TestCtx) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move { Ok(TaskOutcome::poll(Duration::from_millis(20), "waiting")) })
}

fn slow<'a>(_job: &'a mut TestJob, _ctx: &'a TestCtx) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(TaskOutcome::done("slow done"))
    })
}

fn cleanup<'a>(job: &'a mut TestJob, ctx: &'a TestCtx) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        ctx.log(&format!("cleanup:{}", job.chain));
        Ok(TaskOutcome::done("cleaned up"))
    })
}

fn broken_cleanup<'a>(_job: &'a mut TestJob, ctx: &'a TestCtx) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        ctx.log("broken_cleanup");
        Err(TaskError::transient("vmapi", "down"))
    })
}

fn registry() -> TaskRegistry<TestCtx> {
    let mut registry = TaskRegistry::new();
    for task in [
        TaskDescriptor::new("first", first),
        TaskDescriptor::new("second", second),
        TaskDescriptor::new("flaky", flaky).with_retry(2),
        TaskDescriptor::new("flaky_once", flaky).with_retry(1),
        TaskDescriptor::new("rejected", rejected).with_retry(3),
        TaskDescriptor::new("poll_twice", poll_twice).with_timeout(Duration::from_secs(1)),
        TaskDescriptor::new("poll_forever", poll_forever).with_timeout(Duration::from_millis(100)),
        TaskDescriptor::new("poll_long", poll_forever).with_timeout(Duration::from_secs(30)),
        TaskDescriptor::new("slow", slow).with_timeout(Duration::from_millis(50)),
        TaskDescriptor::new("cleanup", cleanup),
        TaskDescriptor::new("broken_cleanup", broken_cleanup),
    ] {
        registry.register(task).unwrap();
    }
    registry
}

fn build(ctx: &TestCtx, chain: &[&str], onerror: &[&str]) -> WorkflowDefinition<TestCtx> {
    registry()
        .workflow("test-workflow", "1.0.0")
        .chain(chain)
        .onerror(onerror)
        .build(ctx)
        .unwrap()
}

fn executor(ctx: Arc<TestCtx>) -> ChainExecutor<TestCtx> {
    ChainExecutor::new(ctx).with_retry_delay(Duration::from_millis(1))
}

// ============================================================================
// Main chain
// ============================================================================

#[tokio::test]
async fn test_main_chain_runs_in_order() {
    let ctx = Arc::new(TestCtx::default());
    let def = build(&ctx, &["first", "second"], &["cleanup"]);
    let mut job = def.new_job(Map::new());

    let status = executor(ctx.clone())
        .run(&def, &mut job, &CancellationToken::new())
        .await;

    assert_eq!(status, JobStatus::Succeeded);
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(ctx.entries(), vec!["first", "second"]);
    assert!(job.param_bool("second_ran"));
    assert_eq!(job.chain_results.len(), 2);
    assert_eq!(job.chain_results[0].result, "first done");
    assert_eq!(job.chain_results[1].chain, ChainKind::Main);
    assert!(job.error.is_none());
    assert!(job.finished_at.is_some());
    assert!(job.current_task.is_none());
}

#[tokio::test]
async fn test_retryable_error_is_retried() {
    let ctx = Arc::new(TestCtx::default());
    ctx.flaky_failures.store(2, Ordering::SeqCst);
    let def = build(&ctx, &["flaky", "second"], &["cleanup"]);
    let mut job = def.new_job(Map::new());

    let status = executor(ctx.clone())
        .run(&def, &mut job, &CancellationToken::new())
        .await;

    assert_eq!(status, JobStatus::Succeeded);
    assert_eq!(ctx.entries(), vec!["flaky", "flaky", "flaky", "second"]);
    assert_eq!(job.result_of("flaky").unwrap().attempts, 3);
}

#[tokio::test]
async fn test_retry_budget_exhausted_runs_onerror() {
    let ctx = Arc::new(TestCtx::default());
    ctx.flaky_failures.store(5, Ordering::SeqCst);
    let def = build(&ctx, &["flaky_once", "second"], &["cleanup"]);
    let mut job = def.new_job(Map::new());

    let status = executor(ctx.clone())
        .run(&def, &mut job, &CancellationToken::new())
        .await;

    assert_eq!(status, JobStatus::Failed);
    assert_eq!(ctx.entries(), vec!["flaky", "flaky", "cleanup:onerror"]);

    let error = job.error.as_ref().unwrap();
    assert_eq!(error.task, "flaky_once");
    assert_eq!(error.code, "TRANSIENT_ERROR");
    assert_eq!(job.result_of("flaky_once").unwrap().attempts, 2);
}

#[tokio::test]
async fn test_non_retryable_error_fails_immediately() {
    let ctx = Arc::new(TestCtx::default());
    let def = build(&ctx, &["rejected", "second"], &["cleanup"]);
    let mut job = def.new_job(Map::new());

    let status = executor(ctx.clone())
        .run(&def, &mut job, &CancellationToken::new())
        .await;

    assert_eq!(status, JobStatus::Failed);
    assert_eq!(ctx.entries(), vec!["rejected", "cleanup:onerror"]);
    assert_eq!(job.result_of("rejected").unwrap().attempts, 1);
    assert_eq!(
        job.result_of("rejected").unwrap().error_code.as_deref(),
        Some("SERVICE_ERROR")
    );
}

// ============================================================================
// Polling and timeouts
// ============================================================================

#[tokio::test]
async fn test_poll_reinvokes_task() {
    let ctx = Arc::new(TestCtx::default());
    let def = build(&ctx, &["poll_twice"], &[]);
    let mut job = def.new_job(Map::new());

    let status = executor(ctx.clone())
        .run(&def, &mut job, &CancellationToken::new())
        .await;

    assert_eq!(status, JobStatus::Succeeded);
    assert_eq!(ctx.entries().len(), 3);
    assert_eq!(job.chain_results[0].result, "done after 2 polls");
    assert_eq!(job.chain_results[0].attempts, 1);
}

#[tokio::test]
async fn test_poll_past_deadline_times_out() {
    let ctx = Arc::new(TestCtx::default());
    let def = build(&ctx, &["poll_forever", "second"], &["cleanup"]);
    let mut job = def.new_job(Map::new());

    let status = executor(ctx.clone())
        .run(&def, &mut job, &CancellationToken::new())
        .await;

    assert_eq!(status, JobStatus::Failed);
    assert_eq!(job.error.as_ref().unwrap().code, "TASK_TIMEOUT");
    assert!(!ctx.entries().contains(&"second".to_string()));
}

#[tokio::test]
async fn test_slow_task_times_out() {
    let ctx = Arc::new(TestCtx::default());
    let def = build(&ctx, &["slow"], &["cleanup"]);
    let mut job = def.new_job(Map::new());

    let started = std::time::Instant::now();
    let status = executor(ctx.clone())
        .run(&def, &mut job, &CancellationToken::new())
        .await;

    assert_eq!(status, JobStatus::Failed);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(job.error.as_ref().unwrap().code, "TASK_TIMEOUT");
    assert_eq!(ctx.entries(), vec!["cleanup:onerror"]);
}

#[tokio::test]
async fn test_workflow_timeout_stops_main_chain() {
    let ctx = Arc::new(TestCtx::default());
    let def = registry()
        .workflow("bounded", "1.0.0")
        .chain(&["poll_long", "second"])
        .onerror(&["cleanup"])
        .timeout(Duration::from_millis(100))
        .build(&ctx)
        .unwrap();
    let mut job = def.new_job(Map::new());

    let status = executor(ctx.clone())
        .run(&def, &mut job, &CancellationToken::new())
        .await;

    assert_eq!(status, JobStatus::Failed);
    assert_eq!(job.error.as_ref().unwrap().code, "TASK_TIMEOUT");
    assert_eq!(ctx.entries(), vec!["cleanup:onerror"]);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_during_poll_runs_oncancel() {
    let ctx = Arc::new(TestCtx::default());
    let def = Arc::new(
        registry()
            .workflow("cancellable", "1.0.0")
            .chain(&["first", "poll_long", "second"])
            .onerror(&["broken_cleanup"])
            .oncancel(&["cleanup"])
            .build(&ctx)
            .unwrap(),
    );
    let job = def.new_job(Map::new());

    let handle = executor(ctx.clone()).spawn(def, job);
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();

    let job = handle.join().await.unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    assert_eq!(job.error.as_ref().unwrap().code, "CANCELLED");
    assert_eq!(job.error.as_ref().unwrap().task, "poll_long");
    assert_eq!(ctx.entries(), vec!["first", "cleanup:oncancel"]);
}

#[tokio::test]
async fn test_cancel_before_start_skips_main_chain() {
    let ctx = Arc::new(TestCtx::default());
    let def = build(&ctx, &["first", "second"], &["cleanup"]);
    let mut job = def.new_job(Map::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let status = executor(ctx.clone()).run(&def, &mut job, &cancel).await;

    // oncancel defaults to the onerror chain
    assert_eq!(status, JobStatus::Canceled);
    assert_eq!(ctx.entries(), vec!["cleanup:oncancel"]);
}

// ============================================================================
// Recovery chains
// ============================================================================

#[tokio::test]
async fn test_failing_recovery_task_does_not_stop_chain() {
    let ctx = Arc::new(TestCtx::default());
    let def = build(&ctx, &["rejected"], &["broken_cleanup", "cleanup"]);
    let mut job = def.new_job(Map::new());

    let status = executor(ctx.clone())
        .run(&def, &mut job, &CancellationToken::new())
        .await;

    assert_eq!(status, JobStatus::Failed);
    assert_eq!(ctx.entries(), vec!["rejected", "broken_cleanup", "cleanup:onerror"]);
    // The job error stays the one that left the main chain
    assert_eq!(job.error.as_ref().unwrap().task, "rejected");
    let broken = job.result_of("broken_cleanup").unwrap();
    assert_eq!(broken.chain, ChainKind::OnError);
    assert_eq!(broken.error_code.as_deref(), Some("TRANSIENT_ERROR"));
    assert!(job.result_of("cleanup").unwrap().error.is_none());
}

#[tokio::test]
async fn test_timed_out_recovery_task_does_not_stop_chain() {
    let ctx = Arc::new(TestCtx::default());
    let def = build(&ctx, &["rejected"], &["poll_forever", "cleanup"]);
    let mut job = def.new_job(Map::new());

    let status = executor(ctx.clone())
        .run(&def, &mut job, &CancellationToken::new())
        .await;

    assert_eq!(status, JobStatus::Failed);
    assert_eq!(ctx.entries(), vec!["rejected", "cleanup:onerror"]);
    assert_eq!(
        job.result_of("poll_forever").unwrap().error_code.as_deref(),
        Some("TASK_TIMEOUT")
    );
    assert_eq!(job.error.as_ref().unwrap().code, "SERVICE_ERROR");
}

#[tokio::test]
async fn test_many_jobs_run_concurrently() {
    let ctx = Arc::new(TestCtx::default());
    let def = Arc::new(build(&ctx, &["poll_twice", "first"], &[]));
    let exec = executor(ctx.clone());

    let handles: Vec<_> = (0..8)
        .map(|_| exec.spawn(def.clone(), def.new_job(Map::new())))
        .collect();

    for handle in handles {
        let job = handle.join().await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }
    assert_eq!(ctx.entries().iter().filter(|e| *e == "first").count(), 8);
}
