// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for task execution.
//!
//! Every task body reports failure through [`TaskError`]. The variant decides
//! whether the executor may retry the task before routing the job to its
//! `onerror` chain.

use std::time::Duration;

use thiserror::Error;

/// Result type using TaskError.
pub type Result<T> = std::result::Result<T, TaskError>;

/// Errors a task can report to the chain executor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TaskError {
    /// Missing or invalid parameter, invalid action or invalid record.
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// The parameter or record field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// HTTP timeout, connection refused, 5xx responses and other
    /// conditions expected to clear up on their own.
    #[error("{service} unavailable: {message}")]
    Transient {
        /// Service that could not be reached.
        service: String,
        /// Error details.
        message: String,
    },

    /// A service rejected the request (4xx, not found).
    #[error("{service} error ({status}): {message}")]
    Service {
        /// Service that rejected the request.
        service: String,
        /// HTTP status code returned.
        status: u16,
        /// Error details.
        message: String,
    },

    /// A compute-node agent task finished with `failure`.
    #[error("Agent task '{task_id}' failed: {message}")]
    AgentTaskFailed {
        /// Agent task identifier.
        task_id: String,
        /// Failure reported by the agent.
        message: String,
    },

    /// Creating a ticket failed.
    #[error("Failed to acquire {scope} ticket for '{id}': {message}")]
    TicketAcquisition {
        /// Ticket scope (`vm`, `fabric_nat`, ...).
        scope: String,
        /// Resource identifier.
        id: String,
        /// Error details.
        message: String,
    },

    /// A ticket did not become active before the task deadline.
    #[error("Timed out waiting for ticket '{ticket}' to become active")]
    TicketTimeout {
        /// Ticket uuid.
        ticket: String,
    },

    /// The task did not finish within its configured timeout.
    #[error("Task '{task}' timed out after {}s", after.as_secs())]
    Timeout {
        /// Task name.
        task: String,
        /// Configured timeout.
        after: Duration,
    },

    /// The job passed its point of no return; a bare retry is unsafe.
    #[error("{message} (retry disallowed)")]
    RetryDisallowed {
        /// Error details.
        message: String,
    },

    /// The job was cancelled while the task was suspended.
    #[error("Job cancelled")]
    Cancelled,
}

impl TaskError {
    /// Build a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Build a transient error.
    pub fn transient(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Transient { .. } => "TRANSIENT_ERROR",
            Self::Service { .. } => "SERVICE_ERROR",
            Self::AgentTaskFailed { .. } => "AGENT_TASK_FAILED",
            Self::TicketAcquisition { .. } => "TICKET_ACQUISITION_ERROR",
            Self::TicketTimeout { .. } => "TICKET_TIMEOUT",
            Self::Timeout { .. } => "TASK_TIMEOUT",
            Self::RetryDisallowed { .. } => "RETRY_DISALLOWED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Whether the executor may invoke the task again (within the task's
    /// retry budget) after this error.
    ///
    /// An agent task that reported failure stays failed; polling it again
    /// reads the same result.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Validation { .. }
                | Self::Service { .. }
                | Self::AgentTaskFailed { .. }
                | Self::RetryDisallowed { .. }
                | Self::Cancelled
        )
    }
}

/// Errors raised while composing workflow definitions.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DefinitionError {
    /// A workflow referenced a task name the registry does not know.
    #[error("workflow '{workflow}' references unknown task '{task}'")]
    UnknownTask {
        /// Workflow name.
        workflow: String,
        /// Missing task name.
        task: String,
    },

    /// A task name was registered twice.
    #[error("task '{0}' is already registered")]
    DuplicateTask(String),

    /// A task needs a capability the execution context does not provide.
    #[error("task '{task}' in workflow '{workflow}' requires unavailable capability '{capability}'")]
    MissingCapability {
        /// Workflow name.
        workflow: String,
        /// Task name.
        task: String,
        /// Capability name.
        capability: String,
    },

    /// A workflow with an empty main chain.
    #[error("workflow '{0}' has an empty chain")]
    EmptyChain(String),
}
