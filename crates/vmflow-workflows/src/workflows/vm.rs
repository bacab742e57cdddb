// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request setup for provision, destroy and the power workflows.

use serde_json::{Value, json};
use std::time::Duration;
use tracing::info;
use vmflow_clients::{AllocationRequest, Nic, VmState};
use vmflow_core::{
    BoxFuture, DefinitionError, Job, TaskDescriptor, TaskError, TaskOutcome, TaskRegistry,
    TaskResult,
};

use crate::keys;
use crate::nics::{NetworkRequest, nic_tags};
use crate::scratch::Scratch;
use crate::services::{Services, capability};
use crate::zone_action::{self, Expectation, ZoneRequest};

/// Task checking provision parameters.
pub const VALIDATE_PROVISION: &str = "validate_provision";
/// Task choosing a server when none was given.
pub const ALLOCATE_SERVER: &str = "allocate_server";
/// Task preparing the provision request.
pub const SETUP_PROVISION_REQUEST: &str = "setup_provision_request";
/// Task preparing the destroy request.
pub const SETUP_DESTROY_REQUEST: &str = "setup_destroy_request";
/// Task preparing the start request.
pub const SETUP_START_REQUEST: &str = "setup_start_request";
/// Task preparing the stop request.
pub const SETUP_STOP_REQUEST: &str = "setup_stop_request";
/// Task preparing the reboot request.
pub const SETUP_REBOOT_REQUEST: &str = "setup_reboot_request";
/// Task preparing the update request.
pub const SETUP_UPDATE_REQUEST: &str = "setup_update_request";

fn validate_provision<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = job.require_str(keys::VM_UUID)?.to_string();
        let mut networks: Vec<NetworkRequest> = job.require_param(keys::NETWORKS)?;
        if networks.is_empty() {
            return Err(TaskError::validation(keys::NETWORKS, "at least one network is required"));
        }
        match networks.iter().filter(|n| n.primary).count() {
            0 => networks[0].primary = true,
            1 => {}
            _ => {
                return Err(TaskError::validation(keys::NETWORKS, "only one network can be primary"));
            }
        }
        job.store_param(keys::NETWORKS, &networks)?;

        match svc.vmapi().get_vm(&vm_uuid, true).await {
            Ok(existing) if job.param_str(keys::SERVER_UUID) != Some(existing.server_uuid.as_str()) => {
                return Err(TaskError::validation(
                    keys::VM_UUID,
                    format!("VM {} already exists on {}", vm_uuid, existing.server_uuid),
                ));
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        Ok(TaskOutcome::done(format!(
            "Provisioning {} on {} networks",
            vm_uuid,
            networks.len()
        )))
    })
}

fn allocate_server<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        if let Some(server) = job.param_str(keys::SERVER_UUID) {
            return Ok(TaskOutcome::done(format!("Server {} requested", server)));
        }

        let networks: Vec<NetworkRequest> = job.get_param(keys::NETWORKS)?.unwrap_or_default();
        let nic_tags = nic_tags(svc, networks.iter().map(|n| n.uuid.as_str())).await?;

        let request = AllocationRequest {
            vm_uuid: job.require_str(keys::VM_UUID)?.to_string(),
            owner_uuid: job.param_str(keys::OWNER_UUID).map(str::to_string),
            image_uuid: job.param_str(keys::IMAGE_UUID).map(str::to_string),
            billing_id: job.param_str(keys::BILLING_ID).map(str::to_string),
            ram: job.param(keys::RAM).and_then(Value::as_u64),
            nic_tags,
            exclude_servers: Vec::new(),
        };
        let allocation = svc.allocator().allocate(&request).await?;

        info!(
            job_id = %job.id,
            vm_uuid = %request.vm_uuid,
            server_uuid = %allocation.server_uuid,
            nic_tags = ?request.nic_tags,
            "Server allocated"
        );
        job.set_param(keys::SERVER_UUID, allocation.server_uuid.clone());
        Ok(TaskOutcome::done(format!("Allocated {}", allocation.server_uuid)))
    })
}

fn setup_provision_request<'a>(
    job: &'a mut Job<Scratch>,
    svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = job.require_str(keys::VM_UUID)?.to_string();
        let server_uuid = job.require_str(keys::SERVER_UUID)?.to_string();
        let nics: Vec<Nic> = job.get_param(keys::NICS)?.unwrap_or_default();
        let autoboot = job.param(keys::AUTOBOOT).and_then(Value::as_bool).unwrap_or(true);

        let payload = json!({
            "uuid": vm_uuid,
            "owner_uuid": job.param(keys::OWNER_UUID),
            "image_uuid": job.param(keys::IMAGE_UUID),
            "billing_id": job.param(keys::BILLING_ID),
            "ram": job.param(keys::RAM),
            "alias": job.param(keys::ALIAS),
            "brand": job.param(keys::BRAND),
            "autoboot": autoboot,
            "nics": nics,
        });

        // Created by an attempt that crashed before recording it
        let exists = match svc.cnapi().load_vm(&server_uuid, &vm_uuid).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e.into()),
        };

        let wanted = if autoboot { VmState::Running } else { VmState::Stopped };
        let request = ZoneRequest::provision(&server_uuid, &vm_uuid, payload)
            .expecting(Expectation::State(wanted));
        zone_action::prepare(job, request, exists);
        Ok(TaskOutcome::done(if exists {
            format!("VM {} already exists on {}", vm_uuid, server_uuid)
        } else {
            format!("Provisioning {} on {}", vm_uuid, server_uuid)
        }))
    })
}

fn setup_destroy_request<'a>(job: &'a mut Job<Scratch>, _svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm = zone_action::job_vm(job)?;
        let request = ZoneRequest::destroy(&vm.server_uuid, &vm.uuid).expecting(Expectation::Destroyed);
        zone_action::prepare(job, request, false);
        Ok(TaskOutcome::done(format!("Destroying {}", vm.uuid)))
    })
}

/// Prepare a power action, skipped when the VM is already in `wanted`.
fn power_request(job: &mut Job<Scratch>, action: &str, wanted: VmState) -> TaskResult {
    let vm = zone_action::job_vm(job)?;
    let skip = vm.state == wanted;
    let request = ZoneRequest::action(&vm.server_uuid, &vm.uuid, action, json!({}))
        .expecting(Expectation::State(wanted));
    zone_action::prepare(job, request, skip);
    Ok(TaskOutcome::done(if skip {
        format!("VM {} is already {}", vm.uuid, wanted)
    } else {
        format!("Requesting {} of {}", action, vm.uuid)
    }))
}

fn setup_start_request<'a>(job: &'a mut Job<Scratch>, _svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move { power_request(job, "start", VmState::Running) })
}

fn setup_stop_request<'a>(job: &'a mut Job<Scratch>, _svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move { power_request(job, "stop", VmState::Stopped) })
}

fn setup_reboot_request<'a>(job: &'a mut Job<Scratch>, _svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm = zone_action::job_vm(job)?;
        let request = ZoneRequest::action(&vm.server_uuid, &vm.uuid, "reboot", json!({}))
            .expecting(Expectation::Updated);
        zone_action::prepare(job, request, false);
        Ok(TaskOutcome::done(format!("Rebooting {}", vm.uuid)))
    })
}

fn setup_update_request<'a>(job: &'a mut Job<Scratch>, _svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm = zone_action::job_vm(job)?;
        let update = match job.param(keys::UPDATE) {
            Some(Value::Object(fields)) if !fields.is_empty() => Value::Object(fields.clone()),
            _ => {
                return Err(TaskError::validation(keys::UPDATE, "expected a non-empty object"));
            }
        };
        let request = ZoneRequest::action(&vm.server_uuid, &vm.uuid, "update", update)
            .expecting(Expectation::Updated);
        zone_action::prepare(job, request, false);
        Ok(TaskOutcome::done(format!("Updating {}", vm.uuid)))
    })
}

/// Register the VM request tasks.
pub fn register(registry: &mut TaskRegistry<Services>) -> Result<(), DefinitionError> {
    registry.register(
        TaskDescriptor::new(VALIDATE_PROVISION, validate_provision)
            .with_timeout(Duration::from_secs(30))
            .with_retry(1)
            .requires(capability::VMAPI),
    )?;
    registry.register(
        TaskDescriptor::new(ALLOCATE_SERVER, allocate_server)
            .with_timeout(Duration::from_secs(60))
            .with_retry(2)
            .requires(capability::ALLOCATOR)
            .requires(capability::NAPI),
    )?;
    registry.register(
        TaskDescriptor::new(SETUP_PROVISION_REQUEST, setup_provision_request)
            .with_timeout(Duration::from_secs(30))
            .with_retry(2)
            .requires(capability::CNAPI),
    )?;

    let setups: [(&str, vmflow_core::TaskFn<Scratch, Services>); 5] = [
        (SETUP_DESTROY_REQUEST, setup_destroy_request),
        (SETUP_START_REQUEST, setup_start_request),
        (SETUP_STOP_REQUEST, setup_stop_request),
        (SETUP_REBOOT_REQUEST, setup_reboot_request),
        (SETUP_UPDATE_REQUEST, setup_update_request),
    ];
    for (name, body) in setups {
        registry.register(TaskDescriptor::new(name, body).with_timeout(Duration::from_secs(10)))?;
    }
    Ok(())
}
