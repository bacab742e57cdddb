// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process chain executor.
//!
//! Runs one job through its workflow definition:
//!
//! 1. Main chain tasks run in order, one at a time.
//! 2. Each attempt is bounded by the task timeout (and the workflow timeout,
//!    when set). `Poll` outcomes sleep and re-invoke the task until it
//!    finishes or the next poll would pass the deadline.
//! 3. Retryable errors are retried up to the task's retry budget.
//! 4. Any other failure switches to the onerror chain. Cancellation is
//!    checked between tasks and while sleeping, and switches to the
//!    oncancel chain.
//! 5. Recovery chains cannot be cancelled. A failing recovery task is
//!    logged and the chain moves on, so later cleanup (ticket release,
//!    failure bookkeeping) always runs.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::TaskError;
use crate::job::{ChainKind, ChainResult, Job, JobError, JobStatus};
use crate::task::{ExecutionContext, TaskDescriptor, TaskOutcome};
use crate::workflow::WorkflowDefinition;

/// Default delay between a failed attempt and its retry.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Runs jobs against a shared execution context.
pub struct ChainExecutor<C: ExecutionContext> {
    ctx: Arc<C>,
    retry_delay: Duration,
}

impl<C: ExecutionContext> Clone for ChainExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            retry_delay: self.retry_delay,
        }
    }
}

/// Handle to a job running on its own tokio task.
pub struct JobHandle<S> {
    id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<Job<S>>,
}

impl<S> JobHandle<S> {
    /// Job identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request cancellation. The running task finishes first, then the
    /// oncancel chain runs.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The job's cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the job to reach a terminal status.
    pub async fn join(self) -> Result<Job<S>, JoinError> {
        self.handle.await
    }
}

impl<C: ExecutionContext> ChainExecutor<C> {
    /// Create an executor for the given context.
    pub fn new(ctx: Arc<C>) -> Self {
        Self {
            ctx,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Set the delay between retries.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// The shared execution context.
    pub fn context(&self) -> &Arc<C> {
        &self.ctx
    }

    /// Run a job on a new tokio task.
    pub fn spawn(
        &self,
        definition: Arc<WorkflowDefinition<C>>,
        mut job: Job<C::Scratch>,
    ) -> JobHandle<C::Scratch> {
        let executor = self.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let id = job.id;

        let handle = tokio::spawn(async move {
            executor.run(&definition, &mut job, &token).await;
            job
        });

        JobHandle { id, cancel, handle }
    }

    /// Run a job to a terminal status.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition<C>,
        job: &mut Job<C::Scratch>,
        cancel: &CancellationToken,
    ) -> JobStatus {
        let started = Instant::now();
        job.status = JobStatus::Running;
        job.chain = ChainKind::Main;

        info!(
            job_id = %job.id,
            workflow = %definition.name,
            version = %definition.version,
            "Job started"
        );

        let workflow_deadline = definition.timeout.map(|t| (Instant::now() + t, t));
        let main = self
            .run_chain(
                &definition.chain,
                ChainKind::Main,
                job,
                cancel,
                workflow_deadline,
            )
            .await;

        let status = match main {
            Ok(()) => JobStatus::Succeeded,
            Err((task, err)) => {
                let cancelled = matches!(err, TaskError::Cancelled) || cancel.is_cancelled();
                job.error = Some(JobError {
                    task: task.clone(),
                    code: err.error_code().to_string(),
                    message: err.to_string(),
                });

                if cancelled {
                    warn!(
                        job_id = %job.id,
                        workflow = %definition.name,
                        task = %task,
                        "Job cancelled, running oncancel chain"
                    );
                    self.run_recovery(&definition.oncancel, ChainKind::OnCancel, job)
                        .await;
                    JobStatus::Canceled
                } else {
                    error!(
                        job_id = %job.id,
                        workflow = %definition.name,
                        task = %task,
                        error_code = err.error_code(),
                        error = %err,
                        "Job failed, running onerror chain"
                    );
                    self.run_recovery(&definition.onerror, ChainKind::OnError, job)
                        .await;
                    JobStatus::Failed
                }
            }
        };

        job.status = status;
        job.current_task = None;
        job.set_task_deadline(None);
        job.finished_at = Some(Utc::now());

        info!(
            job_id = %job.id,
            workflow = %definition.name,
            status = ?status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Job finished"
        );

        status
    }

    async fn run_recovery(
        &self,
        tasks: &[TaskDescriptor<C>],
        kind: ChainKind,
        job: &mut Job<C::Scratch>,
    ) {
        job.chain = kind;
        // Recovery chains run to completion regardless of the job's token
        let never = CancellationToken::new();
        let mut failed = 0usize;
        for task in tasks {
            if let Err(err) = self.run_task(task, kind, job, &never, None).await {
                failed += 1;
                error!(
                    job_id = %job.id,
                    chain = %kind,
                    task = task.name(),
                    error_code = err.error_code(),
                    error = %err,
                    "Recovery task failed, continuing chain"
                );
            }
        }
        if failed > 0 {
            warn!(
                job_id = %job.id,
                chain = %kind,
                failed,
                total = tasks.len(),
                "Recovery chain finished with failures"
            );
        }
    }

    async fn run_chain(
        &self,
        tasks: &[TaskDescriptor<C>],
        kind: ChainKind,
        job: &mut Job<C::Scratch>,
        cancel: &CancellationToken,
        workflow_deadline: Option<(Instant, Duration)>,
    ) -> Result<(), (String, TaskError)> {
        for task in tasks {
            if cancel.is_cancelled() {
                return Err((task.name().to_string(), TaskError::Cancelled));
            }
            if let Some((deadline, timeout)) = workflow_deadline
                && Instant::now() >= deadline
            {
                return Err((
                    task.name().to_string(),
                    TaskError::Timeout {
                        task: job.workflow.clone(),
                        after: timeout,
                    },
                ));
            }

            self.run_task(task, kind, job, cancel, workflow_deadline.map(|(d, _)| d))
                .await
                .map_err(|e| (task.name().to_string(), e))?;
        }
        Ok(())
    }

    async fn run_task(
        &self,
        task: &TaskDescriptor<C>,
        kind: ChainKind,
        job: &mut Job<C::Scratch>,
        cancel: &CancellationToken,
        workflow_deadline: Option<Instant>,
    ) -> Result<(), TaskError> {
        let started_at = Utc::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let mut deadline = Instant::now() + task.timeout();
            if let Some(wd) = workflow_deadline {
                deadline = deadline.min(wd);
            }
            job.current_task = Some(task.name().to_string());
            job.set_task_deadline(Some(deadline));

            debug!(
                job_id = %job.id,
                task = task.name(),
                chain = %kind,
                attempt = attempts,
                "Running task"
            );

            let err = match self.attempt(task, job, cancel, deadline).await {
                Ok(message) => {
                    debug!(job_id = %job.id, task = task.name(), result = %message, "Task done");
                    record(job, task, kind, Ok(message), attempts, started_at);
                    return Ok(());
                }
                Err(err) => err,
            };

            if !err.is_retryable() || attempts > task.retry() || cancel.is_cancelled() {
                record(job, task, kind, Err(&err), attempts, started_at);
                return Err(err);
            }

            warn!(
                job_id = %job.id,
                task = task.name(),
                attempt = attempts,
                retry = task.retry(),
                error = %err,
                "Task failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    record(job, task, kind, Err(&TaskError::Cancelled), attempts, started_at);
                    return Err(TaskError::Cancelled);
                }
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }

    /// One attempt: invoke the body, following `Poll` outcomes until it
    /// finishes or the deadline would be exceeded.
    async fn attempt(
        &self,
        task: &TaskDescriptor<C>,
        job: &mut Job<C::Scratch>,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<String, TaskError> {
        let body = task.body();
        let timed_out = || TaskError::Timeout {
            task: task.name().to_string(),
            after: task.timeout(),
        };

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = match tokio::time::timeout(remaining, body(job, self.ctx.as_ref())).await
            {
                Ok(outcome) => outcome?,
                Err(_) => return Err(timed_out()),
            };

            match outcome {
                TaskOutcome::Done(message) => return Ok(message),
                TaskOutcome::Poll { after, message } => {
                    if Instant::now() + after > deadline {
                        return Err(timed_out());
                    }
                    debug!(
                        job_id = %job.id,
                        task = task.name(),
                        after_ms = after.as_millis() as u64,
                        message = %message,
                        "Task not finished, polling"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TaskError::Cancelled),
                        _ = tokio::time::sleep(after) => {}
                    }
                }
            }
        }
    }
}

fn record<S, C: ExecutionContext>(
    job: &mut Job<S>,
    task: &TaskDescriptor<C>,
    chain: ChainKind,
    result: Result<String, &TaskError>,
    attempts: u32,
    started_at: chrono::DateTime<Utc>,
) {
    let (result, error, error_code) = match result {
        Ok(message) => (message, None, None),
        Err(err) => (
            String::new(),
            Some(err.to_string()),
            Some(err.error_code().to_string()),
        ),
    };
    job.chain_results.push(ChainResult {
        name: task.name().to_string(),
        chain,
        result,
        error,
        error_code,
        attempts,
        started_at,
        finished_at: Utc::now(),
    });
}
