// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task registry and workflow composition.
//!
//! Tasks are registered once under a unique name. Workflows are then
//! composed from names, so the same `release_held_tickets` descriptor can
//! appear in the main, onerror and oncancel chains of many workflows.
//!
//! ```rust,ignore
//! let definition = registry
//!     .workflow("start", "8.0.0")
//!     .chain(&["acquire_vm_ticket", "wait_on_vm_ticket", "setup_start_request",
//!              "zone_action", "wait_task", "check_state", "release_held_tickets"])
//!     .onerror(&["release_held_tickets"])
//!     .build(&services)?;
//! ```

use std::collections::HashMap;
use std::time::Duration;

use crate::error::DefinitionError;
use crate::task::{ExecutionContext, TaskDescriptor};
use crate::workflow::WorkflowDefinition;

/// Named task descriptors.
pub struct TaskRegistry<C: ExecutionContext> {
    tasks: HashMap<String, TaskDescriptor<C>>,
}

impl<C: ExecutionContext> Default for TaskRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ExecutionContext> TaskRegistry<C> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Register a task. Names must be unique.
    pub fn register(&mut self, task: TaskDescriptor<C>) -> Result<(), DefinitionError> {
        if self.tasks.contains_key(task.name()) {
            return Err(DefinitionError::DuplicateTask(task.name().to_string()));
        }
        self.tasks.insert(task.name().to_string(), task);
        Ok(())
    }

    /// Look up a task by name.
    pub fn get(&self, name: &str) -> Option<&TaskDescriptor<C>> {
        self.tasks.get(name)
    }

    /// Whether a task with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Start composing a workflow.
    pub fn workflow(&self, name: impl Into<String>, version: impl Into<String>) -> WorkflowBuilder<'_, C> {
        WorkflowBuilder {
            registry: self,
            name: name.into(),
            version: version.into(),
            chain: Vec::new(),
            onerror: Vec::new(),
            oncancel: None,
            timeout: None,
        }
    }
}

/// Composes a [`WorkflowDefinition`] from registered task names.
pub struct WorkflowBuilder<'r, C: ExecutionContext> {
    registry: &'r TaskRegistry<C>,
    name: String,
    version: String,
    chain: Vec<String>,
    onerror: Vec<String>,
    oncancel: Option<Vec<String>>,
    timeout: Option<Duration>,
}

impl<C: ExecutionContext> WorkflowBuilder<'_, C> {
    /// Append tasks to the main chain.
    pub fn chain(mut self, names: &[&str]) -> Self {
        self.chain.extend(names.iter().map(|n| n.to_string()));
        self
    }

    /// Append tasks to the onerror chain.
    pub fn onerror(mut self, names: &[&str]) -> Self {
        self.onerror.extend(names.iter().map(|n| n.to_string()));
        self
    }

    /// Append tasks to the oncancel chain.
    ///
    /// When never called, the oncancel chain is a copy of the onerror chain.
    pub fn oncancel(mut self, names: &[&str]) -> Self {
        self.oncancel
            .get_or_insert_with(Vec::new)
            .extend(names.iter().map(|n| n.to_string()));
        self
    }

    /// Overall timeout for the main chain.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Resolve names and validate capabilities against `ctx`.
    pub fn build(self, ctx: &C) -> Result<WorkflowDefinition<C>, DefinitionError> {
        if self.chain.is_empty() {
            return Err(DefinitionError::EmptyChain(self.name));
        }

        let chain = self.resolve(&self.chain, ctx)?;
        let onerror = self.resolve(&self.onerror, ctx)?;
        let oncancel = match &self.oncancel {
            Some(names) => self.resolve(names, ctx)?,
            None => onerror.clone(),
        };

        Ok(WorkflowDefinition {
            name: self.name,
            version: self.version,
            chain,
            onerror,
            oncancel,
            timeout: self.timeout,
        })
    }

    fn resolve(&self, names: &[String], ctx: &C) -> Result<Vec<TaskDescriptor<C>>, DefinitionError> {
        names
            .iter()
            .map(|name| {
                let task = self
                    .registry
                    .get(name)
                    .ok_or_else(|| DefinitionError::UnknownTask {
                        workflow: self.name.clone(),
                        task: name.clone(),
                    })?;
                if let Some(missing) = task.capabilities().find(|c| !ctx.provides(*c)) {
                    return Err(DefinitionError::MissingCapability {
                        workflow: self.name.clone(),
                        task: name.clone(),
                        capability: missing.to_string(),
                    });
                }
                Ok(task.clone())
            })
            .collect()
    }
}
