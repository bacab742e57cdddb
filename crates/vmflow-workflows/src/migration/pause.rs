// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `pause`: interrupt the running sync.
//!
//! The sync job holds the VM ticket, so pause runs without one. It cancels
//! the sync job, stops its processes (forcefully if they ignore `stop`) and
//! closes the interrupted sync entry.

use std::time::Duration;
use tracing::info;
use vmflow_core::{
    BoxFuture, DefinitionError, Job, TaskDescriptor, TaskError, TaskOutcome, TaskRegistry,
    TaskResult,
};

use super::progress;
use super::record::{MigrationPhase, MigrationState, ProgressState, load_record};
use super::sync::stop_processes;
use crate::scratch::Scratch;
use crate::services::{Services, capability};

/// Task cancelling the job running the sync.
pub const CANCEL_SYNC_JOB: &str = "migration_cancel_sync_job";
/// Task stopping the sync processes.
pub const STOP_SYNC_PROCESSES: &str = "migration_stop_sync_processes";
/// Task closing the pause progress entry.
pub const PAUSE_FINISH: &str = "migration_pause_finish";

fn cancel_sync_job<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let record = load_record(svc, &vm_uuid).await?;

        let Some(entry) = record
            .running_entries(MigrationPhase::Sync)
            .first()
            .and_then(|&i| record.progress_history.get(i))
        else {
            return Ok(TaskOutcome::done("Sync already stopped"));
        };
        let Some(sync_job) = entry.job_uuid.clone() else {
            return Err(TaskError::validation(
                "migration",
                "running sync has no job to cancel",
            ));
        };

        match svc.jobs().cancel_job(&sync_job).await {
            Ok(()) => {}
            // Finished on its own meanwhile
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        info!(job_id = %job.id, vm_uuid = %vm_uuid, sync_job = %sync_job, "Sync job cancelled");
        Ok(TaskOutcome::done(format!("Sync job {} cancelled", sync_job)))
    })
}

fn stop_sync_processes<'a>(
    job: &'a mut Job<Scratch>,
    svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move { Ok(TaskOutcome::done(stop_processes(job, svc, true).await)) })
}

fn pause_finish<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        progress::finish_phase(job, svc, MigrationPhase::Pause, "sync paused", |r| {
            for i in r.running_entries(MigrationPhase::Sync) {
                r.finish_progress(i, ProgressState::Success, "sync interrupted by pause");
            }
            r.state = MigrationState::Paused;
            r.phase = MigrationPhase::Pause;
        })
        .await
    })
}

/// Register the pause tasks.
pub fn register(registry: &mut TaskRegistry<Services>) -> Result<(), DefinitionError> {
    registry.register(
        TaskDescriptor::new(CANCEL_SYNC_JOB, cancel_sync_job)
            .with_timeout(Duration::from_secs(30))
            .with_retry(2)
            .requires(capability::JOBS)
            .requires(capability::VMAPI),
    )?;
    registry.register(
        TaskDescriptor::new(STOP_SYNC_PROCESSES, stop_sync_processes)
            .with_timeout(Duration::from_secs(120))
            .requires(capability::SYNC)
            .requires(capability::CNAPI),
    )?;
    registry.register(
        TaskDescriptor::new(PAUSE_FINISH, pause_finish)
            .with_timeout(Duration::from_secs(30))
            .with_retry(3)
            .requires(capability::VMAPI),
    )?;
    Ok(())
}
