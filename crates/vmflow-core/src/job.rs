// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job state shared by every task of a chain.
//!
//! `params` is the only resumable state: anything a retried or compensating
//! task must be able to find again goes there. `scratch` is a typed bag for
//! values computed and consumed within one run and is never serialized.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::TaskError;

/// Which chain of the workflow is currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    /// The main chain
    Main,
    /// Recovery chain run after a task failure
    OnError,
    /// Recovery chain run after external cancellation
    OnCancel,
}

impl std::fmt::Display for ChainKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainKind::Main => write!(f, "main"),
            ChainKind::OnError => write!(f, "onerror"),
            ChainKind::OnCancel => write!(f, "oncancel"),
        }
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created but not yet handed to an executor
    Queued,
    /// A chain is executing
    Running,
    /// Main chain completed
    Succeeded,
    /// A main chain task failed (onerror chain has run)
    Failed,
    /// The job was cancelled (oncancel chain has run)
    Canceled,
}

impl JobStatus {
    /// Whether the job has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

/// Outcome of one task, appended after the task finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainResult {
    /// Task name
    pub name: String,
    /// Chain the task belonged to
    pub chain: ChainKind,
    /// Message returned by the task (empty on failure)
    pub result: String,
    /// Error message, if the task failed
    pub error: Option<String>,
    /// Error code, if the task failed
    pub error_code: Option<String>,
    /// Number of attempts made
    pub attempts: u32,
    /// First attempt start
    pub started_at: DateTime<Utc>,
    /// Last attempt end
    pub finished_at: DateTime<Utc>,
}

/// The error that moved a job off its main chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Task that failed
    pub task: String,
    /// Stable error code (see [`TaskError::error_code`])
    pub code: String,
    /// Human readable message
    pub message: String,
}

/// A running (or finished) workflow job.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = "S: Default"))]
pub struct Job<S> {
    /// Job identifier
    pub id: Uuid,
    /// Workflow name
    pub workflow: String,
    /// Workflow version
    pub version: String,
    /// Resumable job parameters
    pub params: Map<String, Value>,
    /// Transient values shared between tasks of a single run
    #[serde(skip)]
    pub scratch: S,
    /// Results of finished tasks, in execution order
    pub chain_results: Vec<ChainResult>,
    /// Name of the task currently executing
    pub current_task: Option<String>,
    /// Chain currently (or last) executing
    pub chain: ChainKind,
    /// Lifecycle status
    pub status: JobStatus,
    /// First error that moved the job off the main chain
    pub error: Option<JobError>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time the job reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    task_deadline: Option<Instant>,
}

impl<S: Default> Job<S> {
    /// Create a queued job.
    pub fn new(
        workflow: impl Into<String>,
        version: impl Into<String>,
        params: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow: workflow.into(),
            version: version.into(),
            params,
            scratch: S::default(),
            chain_results: Vec::new(),
            current_task: None,
            chain: ChainKind::Main,
            status: JobStatus::Queued,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
            task_deadline: None,
        }
    }
}

impl<S> Job<S> {
    /// Raw parameter lookup.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key).filter(|v| !v.is_null())
    }

    /// String parameter lookup.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(Value::as_str)
    }

    /// Boolean parameter lookup; missing or non-boolean reads as `false`.
    pub fn param_bool(&self, key: &str) -> bool {
        self.param(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Typed parameter lookup.
    ///
    /// Returns `Ok(None)` when the key is absent, and a validation error when
    /// the value does not deserialize as `T`.
    pub fn get_param<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, TaskError> {
        match self.param(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| TaskError::validation(key, e.to_string())),
        }
    }

    /// Typed parameter lookup that fails when the key is absent.
    pub fn require_param<T: DeserializeOwned>(&self, key: &str) -> Result<T, TaskError> {
        self.get_param(key)?
            .ok_or_else(|| TaskError::validation(key, "is required"))
    }

    /// Required string parameter.
    pub fn require_str(&self, key: &str) -> Result<&str, TaskError> {
        self.param_str(key)
            .ok_or_else(|| TaskError::validation(key, "is required"))
    }

    /// Store a raw value.
    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.params.insert(key.into(), value.into());
    }

    /// Serialize and store a value.
    pub fn store_param<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), TaskError> {
        let key = key.into();
        let value =
            serde_json::to_value(value).map_err(|e| TaskError::validation(&key, e.to_string()))?;
        self.params.insert(key, value);
        Ok(())
    }

    /// Remove a parameter, returning the previous value.
    pub fn remove_param(&mut self, key: &str) -> Option<Value> {
        self.params.remove(key)
    }

    /// Message of the error that moved the job off its main chain.
    pub fn last_error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }

    /// Result of the most recent run of the named task, if any.
    pub fn result_of(&self, task: &str) -> Option<&ChainResult> {
        self.chain_results.iter().rev().find(|r| r.name == task)
    }

    /// Deadline of the task currently executing.
    pub fn task_deadline(&self) -> Option<Instant> {
        self.task_deadline
    }

    /// Time left before the current task's deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.task_deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether sleeping for `after` would run past the current task deadline.
    pub fn would_exceed_deadline(&self, after: Duration) -> bool {
        self.task_deadline
            .is_some_and(|d| Instant::now() + after > d)
    }

    pub(crate) fn set_task_deadline(&mut self, deadline: Option<Instant>) {
        self.task_deadline = deadline;
    }
}
