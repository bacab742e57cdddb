// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `abort`: delete the hidden target and clean up after syncs.

use serde_json::json;
use std::time::Duration;
use vmflow_core::{
    BoxFuture, DefinitionError, Job, TaskDescriptor, TaskError, TaskOutcome, TaskRegistry,
    TaskResult,
};

use super::progress;
use super::record::{MigrationPhase, MigrationState};
use crate::scratch::Scratch;
use crate::services::{Services, capability};
use crate::zone_action::{self, Expectation, ZoneRequest};

/// Task preparing the request destroying the target copy.
pub const SETUP_DESTROY_TARGET: &str = "migration_setup_destroy_target";
/// Task preparing the request deleting sync snapshots on the source.
pub const SETUP_REMOVE_SYNC_SNAPSHOTS: &str = "migration_setup_remove_sync_snapshots";
/// Task closing the abort progress entry.
pub const ABORT_FINISH: &str = "migration_abort_finish";

fn setup_destroy_target<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let target = super::target_server(job)?;

        let copy = match svc.cnapi().load_vm(&target, &vm_uuid).await {
            Ok(vm) => Some(vm),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        // Never destroy the inventoried copy
        if let Some(vm) = &copy
            && !vm.do_not_inventory
        {
            return Err(TaskError::validation(
                "migration",
                "Target instance does not have the do_not_inventory flag",
            ));
        }

        let request = ZoneRequest::destroy(&target, &vm_uuid).expecting(Expectation::Destroyed);
        zone_action::prepare(job, request, copy.is_none());
        Ok(TaskOutcome::done(if copy.is_some() {
            format!("Destroying target copy on {}", target)
        } else {
            "Target copy already gone".to_string()
        }))
    })
}

fn setup_remove_sync_snapshots<'a>(
    job: &'a mut Job<Scratch>,
    _svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let source = super::source_server(job)?;
        let request = ZoneRequest::migrate(&source, &vm_uuid, "remove_sync_snapshots", json!({}));
        zone_action::prepare(job, request, false);
        Ok(TaskOutcome::done("Removing sync snapshots from the source"))
    })
}

fn abort_finish<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        progress::finish_phase(job, svc, MigrationPhase::Abort, "migration aborted", |r| {
            r.state = MigrationState::Aborted;
            r.source_process = None;
            r.target_process = None;
            r.finished_timestamp = Some(chrono::Utc::now());
        })
        .await
    })
}

/// Register the abort tasks.
pub fn register(registry: &mut TaskRegistry<Services>) -> Result<(), DefinitionError> {
    registry.register(
        TaskDescriptor::new(SETUP_DESTROY_TARGET, setup_destroy_target)
            .with_timeout(Duration::from_secs(30))
            .with_retry(2)
            .requires(capability::CNAPI),
    )?;
    registry.register(
        TaskDescriptor::new(SETUP_REMOVE_SYNC_SNAPSHOTS, setup_remove_sync_snapshots)
            .with_timeout(Duration::from_secs(10))
            .requires(capability::CNAPI),
    )?;
    registry.register(
        TaskDescriptor::new(ABORT_FINISH, abort_finish)
            .with_timeout(Duration::from_secs(30))
            .with_retry(3)
            .requires(capability::VMAPI),
    )?;
    Ok(())
}
