// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task result protocol and task descriptors.
//!
//! A task body is a plain function taking the job and the execution context
//! and returning a boxed future. Returning is the single completion signal:
//!
//! - `Ok(TaskOutcome::Done(msg))` continues with the next task
//! - `Ok(TaskOutcome::Poll { after, .. })` asks to be invoked again after
//!   `after`, bounded by the task timeout
//! - `Err(TaskError)` routes the job to its recovery chain once the retry
//!   budget is used up
//!
//! ```rust,ignore
//! fn check_vm<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
//!     Box::pin(async move {
//!         let vm = svc.vmapi.get_vm(job.require_str("vm_uuid")?, false).await?;
//!         Ok(TaskOutcome::done(format!("VM is {}", vm.state)))
//!     })
//! }
//! ```

use futures::future::BoxFuture;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::TaskError;
use crate::job::Job;

/// Default per-attempt timeout.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(120);

/// What a task asks the executor to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Task finished; the message is stored in the chain result
    Done(String),
    /// Not finished yet; invoke the task again after `after`
    Poll {
        /// Delay before the next invocation
        after: Duration,
        /// Progress message (logged only)
        message: String,
    },
}

impl TaskOutcome {
    /// Shorthand for [`TaskOutcome::Done`].
    pub fn done(message: impl Into<String>) -> Self {
        TaskOutcome::Done(message.into())
    }

    /// Shorthand for [`TaskOutcome::Poll`].
    pub fn poll(after: Duration, message: impl Into<String>) -> Self {
        TaskOutcome::Poll {
            after,
            message: message.into(),
        }
    }
}

/// Result of one task invocation.
pub type TaskResult = Result<TaskOutcome, TaskError>;

/// Task body signature.
pub type TaskFn<S, C> = for<'a> fn(&'a mut Job<S>, &'a C) -> BoxFuture<'a, TaskResult>;

/// A named facility a task needs from its execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Capability(&'static str);

impl Capability {
    /// Declare a capability.
    pub const fn new(name: &'static str) -> Self {
        Capability(name)
    }

    /// Capability name.
    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// The environment tasks run in.
///
/// Implemented by the workflow crate's service bundle. `Scratch` is the typed
/// transient state each job carries.
pub trait ExecutionContext: Send + Sync + 'static {
    /// Per-job transient state.
    type Scratch: Default + Send + Sync + 'static;

    /// Whether this context can serve tasks requiring `capability`.
    fn provides(&self, capability: Capability) -> bool;
}

/// A named task with its execution policy.
pub struct TaskDescriptor<C: ExecutionContext> {
    name: String,
    timeout: Duration,
    retry: u32,
    body: TaskFn<C::Scratch, C>,
    requires: BTreeSet<Capability>,
}

impl<C: ExecutionContext> Clone for TaskDescriptor<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            timeout: self.timeout,
            retry: self.retry,
            body: self.body,
            requires: self.requires.clone(),
        }
    }
}

impl<C: ExecutionContext> std::fmt::Debug for TaskDescriptor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("requires", &self.requires)
            .finish()
    }
}

impl<C: ExecutionContext> TaskDescriptor<C> {
    /// Create a descriptor with the default timeout and no retries.
    pub fn new(name: impl Into<String>, body: TaskFn<C::Scratch, C>) -> Self {
        Self {
            name: name.into(),
            timeout: DEFAULT_TASK_TIMEOUT,
            retry: 0,
            body,
            requires: BTreeSet::new(),
        }
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set how many times a retryable failure is retried.
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    /// Declare a capability this task needs.
    pub fn requires(mut self, capability: Capability) -> Self {
        self.requires.insert(capability);
        self
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Retry budget.
    pub fn retry(&self) -> u32 {
        self.retry
    }

    /// Declared capabilities.
    pub fn capabilities(&self) -> impl Iterator<Item = Capability> + '_ {
        self.requires.iter().copied()
    }

    pub(crate) fn body(&self) -> TaskFn<C::Scratch, C> {
        self.body
    }
}
