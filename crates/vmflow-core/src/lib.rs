// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! vmflow Core - Chain Execution Contract
//!
//! This crate defines how a VM control-plane workflow runs: a job walks an
//! ordered chain of named tasks, each with its own timeout and retry budget,
//! sharing mutable job state. A failing task moves the job to its `onerror`
//! chain; external cancellation moves it to its `oncancel` chain.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        vmflow-workflows                           │
//! │     (tickets, zone actions, fabric NAT, migration, catalog)       │
//! └───────────────────────────────────────────────────────────────────┘
//!           │ registers tasks / builds definitions      │ calls
//!           ▼                                            ▼
//! ┌───────────────────────────────┐      ┌────────────────────────────┐
//! │        vmflow-core            │      │      vmflow-clients        │
//! │  (This Crate)                 │      │  cnapi / vmapi / napi /    │
//! │  Job, TaskRegistry,           │      │  allocator / jobs traits   │
//! │  ChainExecutor, notifier      │      │  + reqwest adapters        │
//! └───────────────────────────────┘      └────────────────────────────┘
//! ```
//!
//! # Task Result Protocol
//!
//! | Outcome | Executor reaction |
//! |---------|-------------------|
//! | `Ok(Done(msg))` | Record result, continue with the next task |
//! | `Ok(Poll { after, .. })` | Sleep `after`, invoke again (bounded by the task timeout) |
//! | `Err(e)` with `e.is_retryable()` | Retry while the retry budget lasts |
//! | `Err(e)` otherwise | Run the `onerror` chain, job ends `failed` |
//! | cancellation requested | Run the `oncancel` chain, job ends `canceled` |
//!
//! # Modules
//!
//! - [`job`]: Job state, parameters and chain results
//! - [`task`]: Task descriptors and the result protocol
//! - [`registry`]: Named task registry and workflow composition
//! - [`workflow`]: Versioned workflow definitions
//! - [`executor`]: In-process chain executor
//! - [`notify`]: Bounded fire-and-forget notification worker
//! - [`config`]: Environment-based configuration
//! - [`error`]: Error types with stable codes
//! - [`telemetry`]: Tracing subscriber setup

#![deny(missing_docs)]

/// Environment-based configuration.
pub mod config;

/// Error types with stable codes.
pub mod error;

/// In-process chain executor.
pub mod executor;

/// Job state.
pub mod job;

/// Fire-and-forget notification worker.
pub mod notify;

/// Task registry and workflow composition.
pub mod registry;

/// Task descriptors and the result protocol.
pub mod task;

/// Tracing subscriber setup.
pub mod telemetry;

/// Versioned workflow definitions.
pub mod workflow;

pub use config::{Config, ConfigError, FabricNatConfig};
pub use error::{DefinitionError, TaskError};
pub use executor::{ChainExecutor, JobHandle};
pub use job::{ChainKind, ChainResult, Job, JobError, JobStatus};
pub use notify::{DetachedNotifier, NotificationSink};
pub use registry::{TaskRegistry, WorkflowBuilder};
pub use task::{Capability, ExecutionContext, TaskDescriptor, TaskFn, TaskOutcome, TaskResult};
pub use workflow::WorkflowDefinition;

// Re-exported so task bodies can name their return type without a direct
// dependency on `futures`.
pub use futures::future::BoxFuture;
pub use tokio_util::sync::CancellationToken;
