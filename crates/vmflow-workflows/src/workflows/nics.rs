// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request setup for `add-nics` and `remove-nics`.

use serde_json::json;
use std::time::Duration;
use vmflow_clients::Nic;
use vmflow_core::{
    BoxFuture, DefinitionError, Job, TaskDescriptor, TaskError, TaskOutcome, TaskRegistry,
    TaskResult,
};

use crate::keys;
use crate::scratch::Scratch;
use crate::services::Services;
use crate::zone_action::{self, Expectation, ZoneRequest};

/// Task preparing the request plugging new NICs into the VM.
pub const SETUP_ADD_NICS_REQUEST: &str = "setup_add_nics_request";
/// Task preparing the request unplugging NICs from the VM.
pub const SETUP_REMOVE_NICS_REQUEST: &str = "setup_remove_nics_request";

fn setup_add_nics_request<'a>(job: &'a mut Job<Scratch>, _svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm = zone_action::job_vm(job)?;
        let nics: Vec<Nic> = job.get_param(keys::NICS)?.unwrap_or_default();
        if nics.is_empty() {
            return Err(TaskError::validation(keys::NICS, "no NICs were provisioned"));
        }

        let count = nics.len();
        let request = ZoneRequest::action(&vm.server_uuid, &vm.uuid, "add_nics", json!({ "nics": nics }))
            .expecting(Expectation::Updated);
        zone_action::prepare(job, request, false);
        Ok(TaskOutcome::done(format!("Adding {} NICs to {}", count, vm.uuid)))
    })
}

fn setup_remove_nics_request<'a>(
    job: &'a mut Job<Scratch>,
    _svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm = zone_action::job_vm(job)?;
        let macs: Vec<String> = job.require_param(keys::MACS)?;
        if macs.is_empty() {
            return Err(TaskError::validation(keys::MACS, "at least one MAC is required"));
        }
        if let Some(unknown) = macs.iter().find(|mac| !vm.nics.iter().any(|n| &n.mac == *mac)) {
            return Err(TaskError::validation(
                keys::MACS,
                format!("VM {} has no NIC {}", vm.uuid, unknown),
            ));
        }

        let request = ZoneRequest::action(&vm.server_uuid, &vm.uuid, "remove_nics", json!({ "macs": macs }))
            .expecting(Expectation::Updated);
        zone_action::prepare(job, request, false);
        Ok(TaskOutcome::done(format!("Removing {} NICs from {}", macs.len(), vm.uuid)))
    })
}

/// Register the NIC request tasks.
pub fn register(registry: &mut TaskRegistry<Services>) -> Result<(), DefinitionError> {
    registry.register(
        TaskDescriptor::new(SETUP_ADD_NICS_REQUEST, setup_add_nics_request)
            .with_timeout(Duration::from_secs(10)),
    )?;
    registry.register(
        TaskDescriptor::new(SETUP_REMOVE_NICS_REQUEST, setup_remove_nics_request)
            .with_timeout(Duration::from_secs(10)),
    )?;
    Ok(())
}
