// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Versioned workflow definitions.

use serde_json::{Map, Value};
use std::time::Duration;

use crate::job::Job;
use crate::task::{ExecutionContext, TaskDescriptor};

/// A resolved workflow: three ordered chains of task descriptors.
///
/// Built through [`crate::registry::WorkflowBuilder`], which resolves task
/// names against a registry and validates declared capabilities.
pub struct WorkflowDefinition<C: ExecutionContext> {
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) chain: Vec<TaskDescriptor<C>>,
    pub(crate) onerror: Vec<TaskDescriptor<C>>,
    pub(crate) oncancel: Vec<TaskDescriptor<C>>,
    pub(crate) timeout: Option<Duration>,
}

impl<C: ExecutionContext> Clone for WorkflowDefinition<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version.clone(),
            chain: self.chain.clone(),
            onerror: self.onerror.clone(),
            oncancel: self.oncancel.clone(),
            timeout: self.timeout,
        }
    }
}

impl<C: ExecutionContext> std::fmt::Debug for WorkflowDefinition<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("chain", &self.task_names())
            .field("onerror", &self.onerror_names())
            .field("oncancel", &self.oncancel_names())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<C: ExecutionContext> WorkflowDefinition<C> {
    /// Workflow name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Workflow version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Overall timeout for the main chain.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Main chain task names in order.
    pub fn task_names(&self) -> Vec<&str> {
        self.chain.iter().map(|t| t.name()).collect()
    }

    /// onerror chain task names in order.
    pub fn onerror_names(&self) -> Vec<&str> {
        self.onerror.iter().map(|t| t.name()).collect()
    }

    /// oncancel chain task names in order.
    pub fn oncancel_names(&self) -> Vec<&str> {
        self.oncancel.iter().map(|t| t.name()).collect()
    }

    /// Create a queued job for this workflow.
    pub fn new_job(&self, params: Map<String, Value>) -> Job<C::Scratch> {
        Job::new(&self.name, &self.version, params)
    }
}
