// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `begin`: place the target and provision a hidden copy of the VM on it.

use serde_json::Value;
use std::time::Duration;
use tracing::info;
use vmflow_clients::{AllocationRequest, VmState};
use vmflow_core::{
    BoxFuture, DefinitionError, Job, TaskDescriptor, TaskError, TaskOutcome, TaskRegistry,
    TaskResult,
};

use super::progress;
use super::record::{MigrationAction, MigrationPhase, MigrationRecord, MigrationState, find_record, load_record, store_record};
use crate::keys;
use crate::scratch::Scratch;
use crate::services::{Services, capability};
use crate::tickets::{self, ALLOCATE_SCOPE, DEFAULT_TICKET_SERVER};
use crate::zone_action::{self, Expectation, ZoneRequest};

/// Task queueing for the placement lock.
pub const ACQUIRE_ALLOCATION_TICKET: &str = "migration_acquire_allocation_ticket";
/// Task waiting for the placement lock.
pub const WAIT_ALLOCATION_TICKET: &str = "migration_wait_allocation_ticket";
/// Task choosing the target server.
pub const ALLOCATE_TARGET: &str = "migration_allocate_target";
/// Task releasing the placement lock.
pub const RELEASE_ALLOCATION_TICKET: &str = "migration_release_allocation_ticket";
/// Task creating the migration record.
pub const CREATE_RECORD: &str = "migration_create_record";
/// Task preparing the target provision request.
pub const SETUP_PROVISION_TARGET: &str = "migration_setup_provision_target";
/// Task closing the begin progress entry.
pub const BEGIN_FINISH: &str = "migration_begin_finish";
/// Task starting the next action of an automatic migration.
pub const KICK_OFF: &str = "migration_kick_off";

/// Placement is serialized datacenter-wide under this id.
const ALLOCATION_ID: &str = "migration";

/// Fields of the source VM that do not carry over to the target copy.
const TARGET_DROPPED_FIELDS: [&str; 4] = ["state", "snapshots", "last_modified", "server_uuid"];

fn acquire_allocation_ticket<'a>(
    job: &'a mut Job<Scratch>,
    svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let ticket =
            tickets::acquire_ticket(job, svc, DEFAULT_TICKET_SERVER, ALLOCATE_SCOPE, ALLOCATION_ID)
                .await?;
        Ok(TaskOutcome::done(format!("Allocation ticket {} acquired", ticket.uuid)))
    })
}

fn wait_allocation_ticket<'a>(
    job: &'a mut Job<Scratch>,
    svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let held = tickets::find_held(job, ALLOCATE_SCOPE, ALLOCATION_ID)
            .ok_or_else(|| TaskError::validation(keys::HELD_TICKETS, "no allocation ticket held"))?;
        tickets::wait_on_ticket(job, svc, &held.uuid).await
    })
}

fn allocate_target<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        if let Some(target) = job.param_str(keys::TARGET_SERVER_UUID) {
            return Ok(TaskOutcome::done(format!("Target server {} already chosen", target)));
        }
        let source = super::source_server(job)?;

        let target = match job.param_str(keys::OVERRIDE_SERVER_UUID) {
            Some(server) => server.to_string(),
            None => {
                let vm = zone_action::job_vm(job)?;
                let nic_tags =
                    crate::nics::nic_tags(svc, vm.nics.iter().map(|n| n.network_uuid.as_str()))
                        .await?;
                let request = AllocationRequest {
                    vm_uuid: vm.uuid.clone(),
                    owner_uuid: vm.owner_uuid.clone(),
                    image_uuid: vm.image_uuid.clone(),
                    billing_id: vm.billing_id.clone(),
                    ram: vm.ram,
                    nic_tags,
                    exclude_servers: vec![source.clone()],
                };
                svc.allocator().allocate(&request).await?.server_uuid
            }
        };

        info!(job_id = %job.id, source = %source, target = %target, "Migration target chosen");
        job.set_param(keys::TARGET_SERVER_UUID, target.clone());
        Ok(TaskOutcome::done(format!("Target server is {}", target)))
    })
}

fn release_allocation_ticket<'a>(
    job: &'a mut Job<Scratch>,
    svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        tickets::release_held_ticket(job, svc, ALLOCATE_SCOPE, ALLOCATION_ID).await;
        Ok(TaskOutcome::done("Allocation ticket released"))
    })
}

fn create_record<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let existing = find_record(svc, &vm_uuid).await?;

        if let (Some(record), Some(id)) = (&existing, job.param_str(keys::MIGRATION_ID))
            && record.id == id
        {
            return Ok(TaskOutcome::done(format!("Migration {} already created", id)));
        }

        let vm = zone_action::job_vm(job)?;
        let mut record = MigrationRecord::new(
            &vm_uuid,
            super::source_server(job)?,
            super::target_server(job)?,
        );
        record.actions.push(super::action(job)?);
        record.automatic = job.param_bool(keys::MIGRATION_AUTOMATIC);
        record.vm_was_running = vm.state == VmState::Running;
        // Replaces a finished migration: CAS against its version
        record.version = existing.map(|r| r.version).unwrap_or(0);

        let index = progress::open(job, &mut record, MigrationPhase::Begin);
        store_record(svc, Some(&job.id.to_string()), &mut record).await?;
        job.set_param(keys::MIGRATION_ID, record.id.clone());
        progress::remember(job, MigrationPhase::Begin, index)?;
        progress::announce(svc, &record, index);

        info!(
            job_id = %job.id,
            vm_uuid = %vm_uuid,
            migration_id = %record.id,
            target = %record.target_server_uuid,
            "Migration created"
        );
        Ok(TaskOutcome::done(format!("Migration {} created", record.id)))
    })
}

fn setup_provision_target<'a>(
    job: &'a mut Job<Scratch>,
    svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm = zone_action::job_vm(job)?;
        let target = super::target_server(job)?;

        let exists = match svc.cnapi().load_vm(&target, &vm.uuid).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e.into()),
        };

        let mut payload = serde_json::to_value(&vm).map_err(|e| {
            TaskError::validation(keys::VM, format!("cannot serialize VM: {}", e))
        })?;
        if let Value::Object(obj) = &mut payload {
            for field in TARGET_DROPPED_FIELDS {
                obj.remove(field);
            }
            obj.insert("do_not_inventory".to_string(), Value::Bool(true));
            obj.insert("vm_migration_target".to_string(), Value::Bool(true));
            obj.insert("autoboot".to_string(), Value::Bool(false));
        }

        let request = ZoneRequest::provision(&target, &vm.uuid, payload)
            .expecting(Expectation::State(VmState::Stopped));
        zone_action::prepare(job, request, exists);
        Ok(TaskOutcome::done(if exists {
            format!("Target copy already exists on {}", target)
        } else {
            format!("Provisioning target copy on {}", target)
        }))
    })
}

fn begin_finish<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let action = super::action(job)?;
        progress::finish_phase(job, svc, MigrationPhase::Begin, "target instance provisioned", |r| {
            r.state = match action {
                MigrationAction::Full | MigrationAction::Start => MigrationState::Running,
                _ => MigrationState::Paused,
            };
        })
        .await
    })
}

fn kick_off<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let record = load_record(svc, &vm_uuid).await?;
        if !record.automatic {
            return Ok(TaskOutcome::done("Migration is not automatic"));
        }

        let next = match super::action(job)? {
            MigrationAction::Begin => MigrationAction::Sync,
            MigrationAction::Sync => MigrationAction::Switch,
            other => return Ok(TaskOutcome::done(format!("Nothing follows {}", other))),
        };
        let response = svc.vmapi().migrate(&vm_uuid, next.as_str()).await?;
        info!(job_id = %job.id, vm_uuid = %vm_uuid, next = %next, next_job = %response.job_uuid, "Automatic migration continues");
        Ok(TaskOutcome::done(format!("{} queued as job {}", next, response.job_uuid)))
    })
}

/// Register the begin tasks.
pub fn register(registry: &mut TaskRegistry<Services>) -> Result<(), DefinitionError> {
    registry.register(
        TaskDescriptor::new(ACQUIRE_ALLOCATION_TICKET, acquire_allocation_ticket)
            .with_timeout(Duration::from_secs(30))
            .with_retry(2)
            .requires(capability::CNAPI),
    )?;
    registry.register(
        TaskDescriptor::new(WAIT_ALLOCATION_TICKET, wait_allocation_ticket)
            .with_timeout(Duration::from_secs(600))
            .with_retry(1)
            .requires(capability::CNAPI),
    )?;
    registry.register(
        TaskDescriptor::new(ALLOCATE_TARGET, allocate_target)
            .with_timeout(Duration::from_secs(60))
            .with_retry(2)
            .requires(capability::ALLOCATOR)
            .requires(capability::NAPI),
    )?;
    registry.register(
        TaskDescriptor::new(RELEASE_ALLOCATION_TICKET, release_allocation_ticket)
            .with_timeout(Duration::from_secs(30))
            .requires(capability::CNAPI),
    )?;
    registry.register(
        TaskDescriptor::new(CREATE_RECORD, create_record)
            .with_timeout(Duration::from_secs(30))
            .with_retry(3)
            .requires(capability::VMAPI),
    )?;
    registry.register(
        TaskDescriptor::new(SETUP_PROVISION_TARGET, setup_provision_target)
            .with_timeout(Duration::from_secs(30))
            .with_retry(2)
            .requires(capability::CNAPI),
    )?;
    registry.register(
        TaskDescriptor::new(BEGIN_FINISH, begin_finish)
            .with_timeout(Duration::from_secs(30))
            .with_retry(3)
            .requires(capability::VMAPI),
    )?;
    registry.register(
        TaskDescriptor::new(KICK_OFF, kick_off)
            .with_timeout(Duration::from_secs(30))
            .with_retry(2)
            .requires(capability::VMAPI),
    )?;
    Ok(())
}
