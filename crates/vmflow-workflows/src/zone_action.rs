// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch-and-verify tasks shared by the VM workflows.
//!
//! A workflow-specific `setup_*_request` task puts a [`ZoneRequest`] in
//! scratch. The generic tasks then run it:
//!
//! ```text
//! setup_*_request ──► zone_action ──► wait_task ──► check_state
//!                     (dispatch)      (poll agent)   check_updated
//!                                                    check_propagated
//! ```
//!
//! `zone_action` records the agent task id together with a fingerprint of
//! the request, so a retry never dispatches the same request twice. Setting
//! `params.skip_zone_action` turns `zone_action` and `wait_task` into no-ops
//! without changing the chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::info;
use vmflow_clients::{AgentTaskStatus, Vm, VmFilter, VmState};
use vmflow_core::{
    BoxFuture, DefinitionError, Job, TaskDescriptor, TaskError, TaskOutcome, TaskRegistry,
    TaskResult,
};

use crate::keys;
use crate::scratch::Scratch;
use crate::services::{Services, capability};

/// Task loading the VM and recording its server and `last_modified`.
pub const GET_VM: &str = "get_vm";
/// Task dispatching the prepared request.
pub const ZONE_ACTION: &str = "zone_action";
/// Task polling the dispatched agent task.
pub const WAIT_TASK: &str = "wait_task";
/// Task polling until the VM reaches the expected state.
pub const CHECK_STATE: &str = "check_state";
/// Task polling until the VM's `last_modified` moves.
pub const CHECK_UPDATED: &str = "check_updated";
/// Task polling until inventory listings show the VM.
pub const CHECK_PROPAGATED: &str = "check_propagated";

/// How a request reaches the compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneMethod {
    /// `POST /servers/{server}/vms/{vm}/{action}`
    Action,
    /// `POST /servers/{server}/vms`
    Provision,
    /// `DELETE /servers/{server}/vms/{vm}`
    Destroy,
}

/// What the check tasks wait for once the agent task is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Expectation {
    /// No check
    Nothing,
    /// VM reaches a state
    State(VmState),
    /// VM no longer exists
    Destroyed,
    /// `last_modified` is newer than the job's baseline
    Updated,
    /// The VM shows up in inventory listings
    Propagated,
}

/// A request for a compute-node agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneRequest {
    /// Server to send the request to
    pub server_uuid: String,
    /// VM the request is about
    pub vm_uuid: String,
    /// Agent action
    pub action: String,
    /// Endpoint family
    pub method: ZoneMethod,
    /// Request body
    pub payload: Value,
    /// Condition verified after the agent task finishes
    pub expects: Expectation,
}

impl ZoneRequest {
    /// An action on an existing VM.
    pub fn action(
        server_uuid: impl Into<String>,
        vm_uuid: impl Into<String>,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            server_uuid: server_uuid.into(),
            vm_uuid: vm_uuid.into(),
            action: action.into(),
            method: ZoneMethod::Action,
            payload,
            expects: Expectation::Nothing,
        }
    }

    /// A migration sub-task (`migrate` action with `migration_task` set).
    pub fn migrate(
        server_uuid: impl Into<String>,
        vm_uuid: impl Into<String>,
        migration_task: &str,
        mut payload: Value,
    ) -> Self {
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("migration_task".to_string(), json!(migration_task));
        } else {
            payload = json!({ "migration_task": migration_task });
        }
        Self::action(server_uuid, vm_uuid, "migrate", payload)
    }

    /// Create a VM on a server.
    pub fn provision(server_uuid: impl Into<String>, vm_uuid: impl Into<String>, payload: Value) -> Self {
        Self {
            method: ZoneMethod::Provision,
            ..Self::action(server_uuid, vm_uuid, "provision", payload)
        }
    }

    /// Destroy a VM on a server.
    pub fn destroy(server_uuid: impl Into<String>, vm_uuid: impl Into<String>) -> Self {
        Self {
            method: ZoneMethod::Destroy,
            ..Self::action(server_uuid, vm_uuid, "destroy", Value::Null)
        }
    }

    /// Set the post-condition.
    pub fn expecting(mut self, expects: Expectation) -> Self {
        self.expects = expects;
        self
    }

    /// Identity of the request, independent of its post-condition.
    pub fn fingerprint(&self) -> String {
        json!({
            "method": self.method,
            "server_uuid": self.server_uuid,
            "vm_uuid": self.vm_uuid,
            "action": self.action,
            "payload": self.payload,
        })
        .to_string()
    }
}

/// Prepare `request` for the next `zone_action`/`wait_task` pair.
///
/// With `skip` set the pair does nothing and the check tasks still verify
/// `request.expects`.
pub fn prepare(job: &mut Job<Scratch>, request: ZoneRequest, skip: bool) {
    job.set_param(keys::SKIP_ZONE_ACTION, skip);
    job.scratch.request = Some(request);
}

/// The VM this job works on, as first read.
pub fn job_vm(job: &Job<Scratch>) -> Result<Vm, TaskError> {
    if let Some(vm) = &job.scratch.vm {
        return Ok(vm.clone());
    }
    job.require_param(keys::VM)
}

fn prepared(job: &Job<Scratch>) -> Result<&ZoneRequest, TaskError> {
    job.scratch
        .request
        .as_ref()
        .ok_or_else(|| TaskError::validation("request", "no zone request prepared"))
}

/// Fetch the copy of the VM the request targets.
///
/// Inventory shows at most one copy of a VM; during a migration the other
/// copy is read from its compute node.
async fn fetch_vm(svc: &Services, request: &ZoneRequest) -> Result<Vm, vmflow_clients::ClientError> {
    let vm = svc.vmapi().get_vm(&request.vm_uuid, true).await?;
    if vm.server_uuid == request.server_uuid {
        return Ok(vm);
    }
    svc.cnapi()
        .load_vm(&request.server_uuid, &request.vm_uuid)
        .await
}

// ============================================================================
// Tasks
// ============================================================================

fn get_vm<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = job.require_str(keys::VM_UUID)?.to_string();
        let vm = svc.vmapi().get_vm(&vm_uuid, false).await?;

        if job.param(keys::SERVER_UUID).is_none() {
            job.set_param(keys::SERVER_UUID, vm.server_uuid.clone());
        }
        if job.param(keys::LAST_MODIFIED).is_none()
            && let Some(modified) = vm.last_modified
        {
            job.store_param(keys::LAST_MODIFIED, &modified)?;
        }
        if job.param(keys::VM).is_none() {
            job.store_param(keys::VM, &vm)?;
        }

        let message = format!("VM {} is {} on {}", vm.uuid, vm.state, vm.server_uuid);
        job.scratch.vm = Some(vm);
        Ok(TaskOutcome::done(message))
    })
}

fn zone_action<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        if job.param_bool(keys::SKIP_ZONE_ACTION) {
            return Ok(TaskOutcome::done("Zone action skipped"));
        }

        let request = prepared(job)?.clone();
        let fingerprint = request.fingerprint();
        if let Some(task_id) = job.param_str(keys::ZONE_ACTION_TASK)
            && job.param_str(keys::ZONE_ACTION_FINGERPRINT) == Some(fingerprint.as_str())
        {
            return Ok(TaskOutcome::done(format!(
                "Agent task {} already dispatched",
                task_id
            )));
        }

        let handle = match request.method {
            ZoneMethod::Action => {
                svc.cnapi()
                    .vm_action(
                        &request.server_uuid,
                        &request.vm_uuid,
                        &request.action,
                        &request.payload,
                    )
                    .await?
            }
            ZoneMethod::Provision => {
                svc.cnapi()
                    .create_vm(&request.server_uuid, &request.payload)
                    .await?
            }
            ZoneMethod::Destroy => {
                svc.cnapi()
                    .destroy_vm(&request.server_uuid, &request.vm_uuid)
                    .await?
            }
        };

        job.set_param(keys::ZONE_ACTION_TASK, handle.id.clone());
        job.set_param(keys::ZONE_ACTION_FINGERPRINT, fingerprint);
        job.remove_param(keys::ZONE_ACTION_RESULT);

        info!(
            job_id = %job.id,
            vm_uuid = %request.vm_uuid,
            server_uuid = %request.server_uuid,
            action = %request.action,
            agent_task = %handle.id,
            "Zone action dispatched"
        );
        Ok(TaskOutcome::done(format!(
            "{} dispatched to {} as agent task {}",
            request.action, request.server_uuid, handle.id
        )))
    })
}

fn wait_task<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        if job.param_bool(keys::SKIP_ZONE_ACTION) {
            return Ok(TaskOutcome::done("Zone action skipped"));
        }

        let task_id = job.require_str(keys::ZONE_ACTION_TASK)?.to_string();
        let task = svc.cnapi().get_task(&task_id).await?;

        match task.status {
            AgentTaskStatus::Complete => {
                match task.result {
                    Some(result) => job.set_param(keys::ZONE_ACTION_RESULT, result),
                    None => {
                        job.remove_param(keys::ZONE_ACTION_RESULT);
                    }
                }
                // Consumed: the next request in the chain dispatches afresh
                job.remove_param(keys::ZONE_ACTION_TASK);
                job.remove_param(keys::ZONE_ACTION_FINGERPRINT);
                Ok(TaskOutcome::done(format!("Agent task {} complete", task_id)))
            }
            AgentTaskStatus::Failure => Err(TaskError::AgentTaskFailed {
                task_id,
                message: task
                    .error
                    .unwrap_or_else(|| "no error reported".to_string()),
            }),
            AgentTaskStatus::Queued | AgentTaskStatus::Active => Ok(TaskOutcome::poll(
                svc.config().task_poll_interval,
                format!(
                    "Agent task {} is {:?} ({}%)",
                    task_id,
                    task.status,
                    task.progress.unwrap_or(0)
                ),
            )),
        }
    })
}

fn check_state<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let request = prepared(job)?;
        let interval = svc.config().task_poll_interval;

        match &request.expects {
            Expectation::Nothing => Ok(TaskOutcome::done("Nothing to check")),
            Expectation::State(wanted) => {
                let vm = fetch_vm(svc, request).await?;
                if vm.state == *wanted {
                    Ok(TaskOutcome::done(format!("VM {} is {}", vm.uuid, vm.state)))
                } else {
                    Ok(TaskOutcome::poll(
                        interval,
                        format!("VM {} is {}, waiting for {}", vm.uuid, vm.state, wanted),
                    ))
                }
            }
            Expectation::Destroyed => match fetch_vm(svc, request).await {
                Err(e) if e.is_not_found() => {
                    Ok(TaskOutcome::done(format!("VM {} is gone", request.vm_uuid)))
                }
                Ok(vm) if vm.state == VmState::Destroyed => {
                    Ok(TaskOutcome::done(format!("VM {} is destroyed", vm.uuid)))
                }
                Ok(vm) => Ok(TaskOutcome::poll(
                    interval,
                    format!("VM {} is {}, waiting for destruction", vm.uuid, vm.state),
                )),
                Err(e) => Err(e.into()),
            },
            other => Err(TaskError::validation(
                "expects",
                format!("check_state cannot verify {:?}", other),
            )),
        }
    })
}

fn check_updated<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        // No baseline: the VM had never been modified when the job started
        let since: Option<DateTime<Utc>> = job.get_param(keys::LAST_MODIFIED)?;
        let request = prepared(job)?;
        let vm = fetch_vm(svc, request).await?;

        match vm.last_modified {
            Some(modified) if since.is_none_or(|since| modified > since) => Ok(
                TaskOutcome::done(format!("VM {} updated at {}", vm.uuid, modified)),
            ),
            _ => Ok(TaskOutcome::poll(
                svc.config().task_poll_interval,
                format!("VM {} not updated yet", vm.uuid),
            )),
        }
    })
}

fn check_propagated<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let request = prepared(job)?;
        let listed = svc
            .vmapi()
            .list_vms(&VmFilter {
                uuid: Some(request.vm_uuid.clone()),
                ..Default::default()
            })
            .await?;

        if listed.iter().any(|vm| vm.server_uuid == request.server_uuid) {
            Ok(TaskOutcome::done(format!("VM {} is listed", request.vm_uuid)))
        } else {
            Ok(TaskOutcome::poll(
                svc.config().task_poll_interval,
                format!("VM {} not listed yet", request.vm_uuid),
            ))
        }
    })
}

/// Register the zone-action tasks.
pub fn register(registry: &mut TaskRegistry<Services>) -> Result<(), DefinitionError> {
    let check_timeout = Duration::from_secs(300);

    registry.register(
        TaskDescriptor::new(GET_VM, get_vm)
            .with_timeout(Duration::from_secs(30))
            .with_retry(2)
            .requires(capability::VMAPI),
    )?;
    registry.register(
        TaskDescriptor::new(ZONE_ACTION, zone_action)
            .with_timeout(Duration::from_secs(60))
            .with_retry(2)
            .requires(capability::CNAPI),
    )?;
    registry.register(
        TaskDescriptor::new(WAIT_TASK, wait_task)
            .with_timeout(Duration::from_secs(3600))
            .with_retry(2)
            .requires(capability::CNAPI),
    )?;
    registry.register(
        TaskDescriptor::new(CHECK_STATE, check_state)
            .with_timeout(check_timeout)
            .with_retry(2)
            .requires(capability::VMAPI)
            .requires(capability::CNAPI),
    )?;
    registry.register(
        TaskDescriptor::new(CHECK_UPDATED, check_updated)
            .with_timeout(check_timeout)
            .with_retry(2)
            .requires(capability::VMAPI)
            .requires(capability::CNAPI),
    )?;
    registry.register(
        TaskDescriptor::new(CHECK_PROPAGATED, check_propagated)
            .with_timeout(check_timeout)
            .with_retry(2)
            .requires(capability::VMAPI),
    )?;
    Ok(())
}
