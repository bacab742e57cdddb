// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `switch`: promote the target copy.
//!
//! Order matters. The source is stopped and synced a final time, the
//! target's addresses are reserved so nothing else grabs them while both
//! copies are hidden, and only then is the source hidden and the target
//! shown. From [`DISALLOW_RETRY`] on, a plain retry is unsafe.

use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};
use vmflow_clients::{Vm, VmState};
use vmflow_core::{
    BoxFuture, DefinitionError, Job, TaskDescriptor, TaskError, TaskOutcome, TaskRegistry,
    TaskResult,
};

use super::progress;
use super::record::{MigrationPhase, MigrationState, ReservedIp, load_record, store_record};
use crate::keys;
use crate::scratch::Scratch;
use crate::services::{Services, capability};
use crate::zone_action::{self, Expectation, ZoneRequest};

/// Task preparing the request stopping the source.
pub const SETUP_STOP_SOURCE: &str = "migration_setup_stop_source";
/// Task reserving the target's IPs.
pub const RESERVE_TARGET_IPS: &str = "migration_reserve_target_ips";
/// Task preparing the request finalizing the target's datasets.
pub const SETUP_TARGET_FILESYSTEM: &str = "migration_setup_target_filesystem";
/// Task preparing the request hiding the source.
pub const SETUP_HIDE_SOURCE: &str = "migration_setup_hide_source";
/// Task preparing the request showing the target.
pub const SETUP_SHOW_TARGET: &str = "migration_setup_show_target";
/// Task marking the point of no return.
pub const DISALLOW_RETRY: &str = "migration_disallow_retry";
/// Task preparing the request restoring dataset properties on the target.
pub const SETUP_RESTORE_TARGET_PROPERTIES: &str = "migration_setup_restore_target_properties";
/// Task unreserving the IPs reserved for the switch.
pub const UNRESERVE_IPS: &str = "migration_unreserve_ips";
/// Task preparing the request starting the target.
pub const SETUP_START_TARGET: &str = "migration_setup_start_target";
/// Task closing the switch progress entry.
pub const SWITCH_FINISH: &str = "migration_switch_finish";

/// Request flipping `do_not_inventory` on one copy.
pub(crate) fn dni_request(server_uuid: &str, vm_uuid: &str, value: bool) -> ZoneRequest {
    ZoneRequest::migrate(
        server_uuid,
        vm_uuid,
        "set_do_not_inventory",
        json!({ "value": value }),
    )
}

/// Request copying dataset properties of `from` onto the copy on `server_uuid`.
pub(crate) fn restore_properties_request(server_uuid: &str, from: &Vm) -> ZoneRequest {
    ZoneRequest::migrate(
        server_uuid,
        &from.uuid,
        "restore_properties",
        json!({
            "indestructible_zoneroot": from.indestructible_zoneroot,
            "indestructible_delegated": from.indestructible_delegated,
            "quota": from.quota,
        }),
    )
}

/// Reserved IPs recorded by this job.
pub(crate) fn reserved_this_run(job: &Job<Scratch>) -> Vec<ReservedIp> {
    job.get_param(keys::MIGRATION_RESERVED_IPS)
        .ok()
        .flatten()
        .unwrap_or_default()
}

/// Unreserve `ips` and drop them from the record.
///
/// Returns how many were unreserved; failures are logged and the IPs stay
/// recorded.
pub(crate) async fn unreserve(
    job: &mut Job<Scratch>,
    svc: &Services,
    ips: Vec<ReservedIp>,
) -> Result<usize, TaskError> {
    let vm_uuid = super::vm_uuid(job)?;
    let mut released = Vec::new();
    for reserved in &ips {
        match svc
            .napi()
            .set_ip_reserved(&reserved.network_uuid, &reserved.ip, false)
            .await
        {
            Ok(_) => released.push(reserved.clone()),
            Err(e) if e.is_not_found() => released.push(reserved.clone()),
            Err(e) => {
                warn!(job_id = %job.id, ip = %reserved.ip, network_uuid = %reserved.network_uuid, error = %e, "Failed to unreserve IP");
            }
        }
    }

    let mut record = load_record(svc, &vm_uuid).await?;
    record.reserved_network_ips.retain(|r| !released.contains(r));
    store_record(svc, Some(&job.id.to_string()), &mut record).await?;

    let left: Vec<ReservedIp> = reserved_this_run(job)
        .into_iter()
        .filter(|r| !released.contains(r))
        .collect();
    if left.is_empty() {
        job.remove_param(keys::MIGRATION_RESERVED_IPS);
    } else {
        job.store_param(keys::MIGRATION_RESERVED_IPS, &left)?;
    }
    Ok(released.len())
}

fn setup_stop_source<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let source = super::source_server(job)?;
        let vm = svc.cnapi().load_vm(&source, &vm_uuid).await?;
        let running = vm.state == VmState::Running;

        if job.param(keys::MIGRATION_VM_WAS_RUNNING).is_none() {
            job.set_param(keys::MIGRATION_VM_WAS_RUNNING, running);
        }
        let request = ZoneRequest::action(&source, &vm_uuid, "stop", json!({}))
            .expecting(Expectation::State(VmState::Stopped));
        zone_action::prepare(job, request, !running);
        Ok(TaskOutcome::done(format!("Source is {}", vm.state)))
    })
}

fn reserve_target_ips<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let target = super::target_server(job)?;
        let vm = svc.cnapi().load_vm(&target, &vm_uuid).await?;

        let mut ours = reserved_this_run(job);
        let mut newly = Vec::new();
        for nic in &vm.nics {
            let Some(ip) = &nic.ip else {
                continue;
            };
            let wanted = ReservedIp {
                network_uuid: nic.network_uuid.clone(),
                ip: ip.clone(),
            };
            if ours.contains(&wanted) {
                continue;
            }
            let entry = svc.napi().get_ip(&wanted.network_uuid, &wanted.ip).await?;
            if entry.reserved {
                continue;
            }
            svc.napi()
                .set_ip_reserved(&wanted.network_uuid, &wanted.ip, true)
                .await?;
            ours.push(wanted.clone());
            newly.push(wanted);
            job.store_param(keys::MIGRATION_RESERVED_IPS, &ours)?;
        }

        let mut record = load_record(svc, &vm_uuid).await?;
        for reserved in &ours {
            if !record.reserved_network_ips.contains(reserved) {
                record.reserved_network_ips.push(reserved.clone());
            }
        }
        store_record(svc, Some(&job.id.to_string()), &mut record).await?;

        info!(job_id = %job.id, vm_uuid = %vm_uuid, reserved = newly.len(), "Target IPs reserved");
        Ok(TaskOutcome::done(format!("Reserved {} IPs", newly.len())))
    })
}

fn setup_target_filesystem<'a>(
    job: &'a mut Job<Scratch>,
    _svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let target = super::target_server(job)?;
        zone_action::prepare(job, ZoneRequest::migrate(&target, &vm_uuid, "setup", json!({})), false);
        Ok(TaskOutcome::done("Finalizing target datasets"))
    })
}

fn setup_hide_source<'a>(job: &'a mut Job<Scratch>, _svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let source = super::source_server(job)?;
        zone_action::prepare(job, dni_request(&source, &vm_uuid, true), false);
        Ok(TaskOutcome::done("Hiding source"))
    })
}

fn setup_show_target<'a>(job: &'a mut Job<Scratch>, _svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let target = super::target_server(job)?;
        zone_action::prepare(job, dni_request(&target, &vm_uuid, false), false);
        Ok(TaskOutcome::done("Showing target"))
    })
}

fn disallow_retry<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        job.set_param(keys::MIGRATION_DISALLOW_RETRY, true);

        let vm_uuid = super::vm_uuid(job)?;
        let mut record = load_record(svc, &vm_uuid).await?;
        let phase = progress::current_phase(job).unwrap_or(record.phase);
        if let Some(entry) = progress::progress_index(job, phase)
            .and_then(|i| record.progress_history.get_mut(i))
        {
            entry.disallow_retry = true;
        }
        store_record(svc, Some(&job.id.to_string()), &mut record).await?;
        Ok(TaskOutcome::done("Retry disallowed from here on"))
    })
}

fn setup_restore_target_properties<'a>(
    job: &'a mut Job<Scratch>,
    _svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm = zone_action::job_vm(job)?;
        let target = super::target_server(job)?;
        zone_action::prepare(job, restore_properties_request(&target, &vm), false);
        Ok(TaskOutcome::done("Restoring target dataset properties"))
    })
}

fn unreserve_ips<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let record = load_record(svc, &vm_uuid).await?;

        // Includes reservations left behind by an earlier failed switch
        let mut ips = reserved_this_run(job);
        for reserved in record.reserved_network_ips {
            if !ips.contains(&reserved) {
                ips.push(reserved);
            }
        }
        if ips.is_empty() {
            return Ok(TaskOutcome::done("No IPs reserved"));
        }

        let released = unreserve(job, svc, ips).await?;
        Ok(TaskOutcome::done(format!("Unreserved {} IPs", released)))
    })
}

fn setup_start_target<'a>(job: &'a mut Job<Scratch>, _svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let target = super::target_server(job)?;
        let was_running = match job.param(keys::MIGRATION_VM_WAS_RUNNING) {
            Some(_) => job.param_bool(keys::MIGRATION_VM_WAS_RUNNING),
            None => zone_action::job_vm(job)?.state == VmState::Running,
        };

        let expects = if was_running {
            Expectation::State(VmState::Running)
        } else {
            Expectation::Nothing
        };
        let request = ZoneRequest::action(&target, &vm_uuid, "start", json!({})).expecting(expects);
        zone_action::prepare(job, request, !was_running);
        Ok(TaskOutcome::done(if was_running {
            "Starting target"
        } else {
            "Target stays stopped"
        }))
    })
}

fn switch_finish<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        progress::finish_phase(job, svc, MigrationPhase::Switch, "switch complete", |r| {
            r.state = MigrationState::Successful;
            r.finished_timestamp = Some(chrono::Utc::now());
        })
        .await
    })
}

/// Register the switch tasks.
pub fn register(registry: &mut TaskRegistry<Services>) -> Result<(), DefinitionError> {
    let setups: [(&str, vmflow_core::TaskFn<Scratch, Services>); 6] = [
        (SETUP_STOP_SOURCE, setup_stop_source),
        (SETUP_TARGET_FILESYSTEM, setup_target_filesystem),
        (SETUP_HIDE_SOURCE, setup_hide_source),
        (SETUP_SHOW_TARGET, setup_show_target),
        (SETUP_RESTORE_TARGET_PROPERTIES, setup_restore_target_properties),
        (SETUP_START_TARGET, setup_start_target),
    ];
    for (name, body) in setups {
        registry.register(
            TaskDescriptor::new(name, body)
                .with_timeout(Duration::from_secs(30))
                .with_retry(2)
                .requires(capability::CNAPI),
        )?;
    }

    registry.register(
        TaskDescriptor::new(RESERVE_TARGET_IPS, reserve_target_ips)
            .with_timeout(Duration::from_secs(60))
            .with_retry(2)
            .requires(capability::NAPI)
            .requires(capability::VMAPI),
    )?;
    registry.register(
        TaskDescriptor::new(DISALLOW_RETRY, disallow_retry)
            .with_timeout(Duration::from_secs(30))
            .with_retry(3)
            .requires(capability::VMAPI),
    )?;
    registry.register(
        TaskDescriptor::new(UNRESERVE_IPS, unreserve_ips)
            .with_timeout(Duration::from_secs(60))
            .with_retry(2)
            .requires(capability::NAPI)
            .requires(capability::VMAPI),
    )?;
    registry.register(
        TaskDescriptor::new(SWITCH_FINISH, switch_finish)
            .with_timeout(Duration::from_secs(30))
            .with_retry(3)
            .requires(capability::VMAPI),
    )?;
    Ok(())
}
