// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `rollback`: promote the source back after a successful switch.
//!
//! The mirror of switch without the data copy. The target is stopped and
//! hidden before the source is shown, and destroyed last.

use serde_json::json;
use std::time::Duration;
use vmflow_clients::VmState;
use vmflow_core::{
    BoxFuture, DefinitionError, Job, TaskDescriptor, TaskOutcome, TaskRegistry, TaskResult,
};

use super::progress;
use super::record::{MigrationPhase, MigrationState};
use super::switch::{dni_request, restore_properties_request};
use crate::keys;
use crate::scratch::Scratch;
use crate::services::{Services, capability};
use crate::zone_action::{self, Expectation, ZoneRequest};

/// Task preparing the request stopping the target.
pub const SETUP_STOP_TARGET: &str = "migration_setup_stop_target";
/// Task preparing the request hiding the target.
pub const SETUP_HIDE_TARGET: &str = "migration_setup_hide_target";
/// Task preparing the request showing the source.
pub const SETUP_SHOW_SOURCE: &str = "migration_setup_show_source";
/// Task preparing the request restoring dataset properties on the source.
pub const SETUP_RESTORE_SOURCE_PROPERTIES: &str = "migration_setup_restore_source_properties";
/// Task preparing the request starting the source.
pub const SETUP_START_SOURCE: &str = "migration_setup_start_source";
/// Task closing the rollback progress entry.
pub const ROLLBACK_FINISH: &str = "migration_rollback_finish";

fn setup_stop_target<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let target = super::target_server(job)?;
        let vm = svc.cnapi().load_vm(&target, &vm_uuid).await?;
        let running = vm.state == VmState::Running;

        if job.param(keys::MIGRATION_TARGET_WAS_RUNNING).is_none() {
            job.set_param(keys::MIGRATION_TARGET_WAS_RUNNING, running);
        }
        let request = ZoneRequest::action(&target, &vm_uuid, "stop", json!({}))
            .expecting(Expectation::State(VmState::Stopped));
        zone_action::prepare(job, request, !running);
        Ok(TaskOutcome::done(format!("Target is {}", vm.state)))
    })
}

fn setup_hide_target<'a>(job: &'a mut Job<Scratch>, _svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let target = super::target_server(job)?;
        zone_action::prepare(job, dni_request(&target, &vm_uuid, true), false);
        Ok(TaskOutcome::done("Hiding target"))
    })
}

fn setup_show_source<'a>(job: &'a mut Job<Scratch>, _svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let source = super::source_server(job)?;
        zone_action::prepare(job, dni_request(&source, &vm_uuid, false), false);
        Ok(TaskOutcome::done("Showing source"))
    })
}

fn setup_restore_source_properties<'a>(
    job: &'a mut Job<Scratch>,
    svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let source = super::source_server(job)?;
        let target = super::target_server(job)?;
        // The target carried the properties while it was the live copy
        let live = svc.cnapi().load_vm(&target, &vm_uuid).await?;
        zone_action::prepare(job, restore_properties_request(&source, &live), false);
        Ok(TaskOutcome::done("Restoring source dataset properties"))
    })
}

fn setup_start_source<'a>(job: &'a mut Job<Scratch>, _svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let source = super::source_server(job)?;
        let start = job.param_bool(keys::MIGRATION_TARGET_WAS_RUNNING);

        let expects = if start {
            Expectation::State(VmState::Running)
        } else {
            Expectation::Nothing
        };
        let request = ZoneRequest::action(&source, &vm_uuid, "start", json!({})).expecting(expects);
        zone_action::prepare(job, request, !start);
        Ok(TaskOutcome::done(if start {
            "Starting source"
        } else {
            "Source stays stopped"
        }))
    })
}

fn rollback_finish<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        progress::finish_phase(job, svc, MigrationPhase::Rollback, "rollback complete", |r| {
            r.state = MigrationState::Successful;
            r.phase = MigrationPhase::Rollback;
            r.finished_timestamp = Some(chrono::Utc::now());
        })
        .await
    })
}

/// Register the rollback tasks.
pub fn register(registry: &mut TaskRegistry<Services>) -> Result<(), DefinitionError> {
    let setups: [(&str, vmflow_core::TaskFn<Scratch, Services>); 5] = [
        (SETUP_STOP_TARGET, setup_stop_target),
        (SETUP_HIDE_TARGET, setup_hide_target),
        (SETUP_SHOW_SOURCE, setup_show_source),
        (SETUP_RESTORE_SOURCE_PROPERTIES, setup_restore_source_properties),
        (SETUP_START_SOURCE, setup_start_source),
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
        TaskDescriptor::new(ROLLBACK_FINISH, rollback_finish)
            .with_timeout(Duration::from_secs(30))
            .with_retry(3)
            .requires(capability::VMAPI),
    )?;
    Ok(())
}
