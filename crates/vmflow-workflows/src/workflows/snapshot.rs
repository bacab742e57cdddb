// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request setup for the snapshot workflows.

use serde_json::json;
use std::time::Duration;
use vmflow_clients::{Vm, VmState};
use vmflow_core::{
    BoxFuture, DefinitionError, Job, TaskDescriptor, TaskError, TaskOutcome, TaskRegistry,
    TaskResult,
};

use crate::keys;
use crate::scratch::Scratch;
use crate::services::Services;
use crate::zone_action::{self, Expectation, ZoneRequest};

/// Task preparing the snapshot creation request.
pub const SETUP_SNAPSHOT_REQUEST: &str = "setup_snapshot_request";
/// Task preparing the snapshot rollback request.
pub const SETUP_ROLLBACK_SNAPSHOT_REQUEST: &str = "setup_rollback_snapshot_request";
/// Task preparing the snapshot deletion request.
pub const SETUP_DELETE_SNAPSHOT_REQUEST: &str = "setup_delete_snapshot_request";

fn snapshot_name(job: &Job<Scratch>) -> Result<String, TaskError> {
    let name = job.require_str(keys::SNAPSHOT_NAME)?;
    if name.is_empty() || name.len() > 64 || name.contains(['@', '/']) {
        return Err(TaskError::validation(
            keys::SNAPSHOT_NAME,
            format!("invalid snapshot name {:?}", name),
        ));
    }
    Ok(name.to_string())
}

fn require_snapshot(vm: &Vm, name: &str) -> Result<(), TaskError> {
    if vm.snapshots.iter().any(|s| s.name == name) {
        Ok(())
    } else {
        Err(TaskError::validation(
            keys::SNAPSHOT_NAME,
            format!("VM {} has no snapshot {}", vm.uuid, name),
        ))
    }
}

fn setup_snapshot_request<'a>(job: &'a mut Job<Scratch>, _svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm = zone_action::job_vm(job)?;
        let name = snapshot_name(job)?;
        if vm.snapshots.iter().any(|s| s.name == name) {
            return Err(TaskError::validation(
                keys::SNAPSHOT_NAME,
                format!("snapshot {} already exists", name),
            ));
        }
        let request = ZoneRequest::action(
            &vm.server_uuid,
            &vm.uuid,
            "create_snapshot",
            json!({ "snapshot_name": name }),
        )
        .expecting(Expectation::Updated);
        zone_action::prepare(job, request, false);
        Ok(TaskOutcome::done(format!("Creating snapshot {}", name)))
    })
}

fn setup_rollback_snapshot_request<'a>(
    job: &'a mut Job<Scratch>,
    _svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm = zone_action::job_vm(job)?;
        let name = snapshot_name(job)?;
        require_snapshot(&vm, &name)?;

        // The agent stops a running VM for the rollback and starts it again
        let restart = vm.state == VmState::Running;
        let request = ZoneRequest::action(
            &vm.server_uuid,
            &vm.uuid,
            "rollback_snapshot",
            json!({ "snapshot_name": name, "restart": restart }),
        )
        .expecting(Expectation::Updated);
        zone_action::prepare(job, request, false);
        Ok(TaskOutcome::done(format!(
            "Rolling back to {} (restart: {})",
            name, restart
        )))
    })
}

fn setup_delete_snapshot_request<'a>(
    job: &'a mut Job<Scratch>,
    _svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm = zone_action::job_vm(job)?;
        let name = snapshot_name(job)?;
        require_snapshot(&vm, &name)?;
        let request = ZoneRequest::action(
            &vm.server_uuid,
            &vm.uuid,
            "delete_snapshot",
            json!({ "snapshot_name": name }),
        )
        .expecting(Expectation::Updated);
        zone_action::prepare(job, request, false);
        Ok(TaskOutcome::done(format!("Deleting snapshot {}", name)))
    })
}

/// Register the snapshot request tasks.
pub fn register(registry: &mut TaskRegistry<Services>) -> Result<(), DefinitionError> {
    let setups: [(&str, vmflow_core::TaskFn<Scratch, Services>); 3] = [
        (SETUP_SNAPSHOT_REQUEST, setup_snapshot_request),
        (SETUP_ROLLBACK_SNAPSHOT_REQUEST, setup_rollback_snapshot_request),
        (SETUP_DELETE_SNAPSHOT_REQUEST, setup_delete_snapshot_request),
    ];
    for (name, body) in setups {
        registry.register(TaskDescriptor::new(name, body).with_timeout(Duration::from_secs(10)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn test_snapshot_name_rejects_dataset_separators() {
        let mut params = Map::new();
        params.insert(keys::SNAPSHOT_NAME.to_string(), json!("a@b"));
        let mut job: Job<Scratch> = Job::new("snapshot", "8.0.0", params);
        assert!(snapshot_name(&job).is_err());

        job.set_param(keys::SNAPSHOT_NAME, "");
        assert!(snapshot_name(&job).is_err());

        job.set_param(keys::SNAPSHOT_NAME, "nightly");
        assert_eq!(snapshot_name(&job).unwrap(), "nightly");
    }
}
