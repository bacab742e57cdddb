// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Preconditions of each migration action.
//!
//! Validation runs before any progress entry is opened, so a rejected
//! action leaves the record untouched.

use std::time::Duration;
use tracing::info;
use vmflow_clients::Vm;
use vmflow_core::{
    BoxFuture, DefinitionError, Job, TaskDescriptor, TaskError, TaskOutcome, TaskRegistry,
    TaskResult,
};

use super::record::{MigrationAction, MigrationPhase, MigrationRecord, MigrationState, find_record};
use crate::keys;
use crate::scratch::Scratch;
use crate::services::{Services, capability};

/// Task checking the requested action against the VM and record.
pub const VALIDATE_MIGRATION: &str = "migration_validate";

fn invalid(message: impl Into<String>) -> TaskError {
    TaskError::validation("migration", message)
}

fn require_record(record: Option<MigrationRecord>, vm_uuid: &str) -> Result<MigrationRecord, TaskError> {
    record.ok_or_else(|| invalid(format!("no migration found for VM {}", vm_uuid)))
}

fn require_idle(record: &MigrationRecord) -> Result<(), TaskError> {
    if record.state == MigrationState::Running {
        return Err(invalid(format!(
            "migration {} is already running ({})",
            record.id, record.phase
        )));
    }
    Ok(())
}

fn require_phase(record: &MigrationRecord, action: MigrationAction, allowed: &[MigrationPhase]) -> Result<(), TaskError> {
    if record.state == MigrationState::Successful
        || record.state == MigrationState::Aborted
        || !allowed.contains(&record.phase)
    {
        return Err(invalid(format!(
            "cannot {} a migration that is {} in phase {}",
            action, record.state, record.phase
        )));
    }
    if record.phase == MigrationPhase::Begin && record.state == MigrationState::Failed {
        return Err(invalid("begin failed; abort the migration"));
    }
    Ok(())
}

/// Load a copy of the VM directly from a server.
async fn load_copy(svc: &Services, server_uuid: &str, vm_uuid: &str) -> Result<Option<Vm>, TaskError> {
    match svc.cnapi().load_vm(server_uuid, vm_uuid).await {
        Ok(vm) => Ok(Some(vm)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn check(
    svc: &Services,
    action: MigrationAction,
    vm: &Vm,
    record: Option<MigrationRecord>,
    override_server: Option<&str>,
) -> Result<Option<MigrationRecord>, TaskError> {
    if action.creates_record() {
        if let Some(existing) = &record
            && !existing.is_finished()
        {
            return Err(invalid(format!(
                "VM {} already has an active migration ({} {})",
                vm.uuid, existing.phase, existing.state
            )));
        }
        if vm.do_not_inventory || vm.vm_migration_target {
            return Err(invalid("cannot migrate a hidden or migration target instance"));
        }
        if override_server == Some(vm.server_uuid.as_str()) {
            return Err(TaskError::validation(
                keys::OVERRIDE_SERVER_UUID,
                "target server must differ from the source server",
            ));
        }
        return Ok(record);
    }

    let record = require_record(record, &vm.uuid)?;
    match action {
        MigrationAction::Sync => {
            require_idle(&record)?;
            require_phase(
                &record,
                action,
                &[MigrationPhase::Begin, MigrationPhase::Sync, MigrationPhase::Pause],
            )?;
        }
        MigrationAction::Pause => {
            let running = record.running_entries(MigrationPhase::Sync);
            match running.len() {
                1 => {}
                0 => return Err(invalid("no running sync to pause")),
                n => return Err(invalid(format!("{} syncs are running, cannot pick one", n))),
            }
        }
        MigrationAction::Switch => {
            require_idle(&record)?;
            if record.num_sync_phases < 1 {
                return Err(TaskError::validation(
                    "num_sync_phases",
                    "switch requires at least one completed sync",
                ));
            }
            require_phase(&record, action, &[MigrationPhase::Sync, MigrationPhase::Pause])?;
        }
        MigrationAction::Abort => {
            require_idle(&record)?;
            if matches!(record.state, MigrationState::Successful | MigrationState::Aborted) {
                return Err(invalid(format!("cannot abort a {} migration", record.state)));
            }
            if let Some(target) = load_copy(svc, &record.target_server_uuid, &vm.uuid).await?
                && !target.do_not_inventory
            {
                return Err(invalid("Target instance does not have the do_not_inventory flag"));
            }
        }
        MigrationAction::Rollback => {
            if record.state != MigrationState::Successful || record.phase != MigrationPhase::Switch {
                return Err(invalid(format!(
                    "can only roll back a successful switch, migration is {} in phase {}",
                    record.state, record.phase
                )));
            }
            if load_copy(svc, &record.target_server_uuid, &vm.uuid).await?.is_none() {
                return Err(invalid("target instance no longer exists"));
            }
            match load_copy(svc, &record.source_server_uuid, &vm.uuid).await? {
                Some(source) if source.do_not_inventory => {}
                Some(_) => {
                    return Err(invalid("Source instance does not have the do_not_inventory flag"));
                }
                None => return Err(invalid("source instance no longer exists")),
            }
        }
        MigrationAction::Begin | MigrationAction::Full | MigrationAction::Start => {}
    }
    Ok(Some(record))
}

fn validate_migration<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let action = super::action(job)?;
        let vm = svc.vmapi().get_vm(&vm_uuid, false).await?;
        let record = find_record(svc, &vm_uuid).await?;

        let override_server = job.param_str(keys::OVERRIDE_SERVER_UUID).map(str::to_string);
        let record = check(svc, action, &vm, record, override_server.as_deref()).await?;

        // Creating actions start a new record; the servers come from placement
        let (source, target) = match &record {
            Some(r) if !action.creates_record() => {
                (r.source_server_uuid.clone(), Some(r.target_server_uuid.clone()))
            }
            _ => (vm.server_uuid.clone(), None),
        };
        job.set_param(keys::SERVER_UUID, source);
        if let Some(target) = target {
            job.set_param(keys::TARGET_SERVER_UUID, target);
        }
        if let Some(r) = &record
            && !action.creates_record()
        {
            job.set_param(keys::MIGRATION_ID, r.id.clone());
        }
        job.store_param(keys::VM, &vm)?;

        info!(job_id = %job.id, vm_uuid = %vm_uuid, action = %action, "Migration action validated");
        let message = format!("{} of VM {} ({}) is valid", action, vm.uuid, vm.state);
        job.scratch.vm = Some(vm);
        Ok(TaskOutcome::done(message))
    })
}

/// Register the validation task.
pub fn register(registry: &mut TaskRegistry<Services>) -> Result<(), DefinitionError> {
    registry.register(
        TaskDescriptor::new(VALIDATE_MIGRATION, validate_migration)
            .with_timeout(Duration::from_secs(30))
            .with_retry(1)
            .requires(capability::VMAPI)
            .requires(capability::CNAPI),
    )
}
