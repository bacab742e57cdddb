// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Progress entries: opening, finishing and announcing them.
//!
//! Each phase a job runs gets one entry in `record.progress_history`; its
//! index is kept in `params.migration_progress` so retries and the
//! recovery chain find it again.

use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;
use vmflow_clients::MigrationProgressEvent;
use vmflow_core::{
    BoxFuture, DefinitionError, Job, TaskDescriptor, TaskError, TaskOutcome, TaskRegistry,
    TaskResult,
};

use super::record::{MigrationPhase, MigrationRecord, MigrationState, ProgressState, load_record, store_record};
use crate::keys;
use crate::scratch::Scratch;
use crate::services::{Services, capability};

/// Task opening the sync progress entry.
pub const SYNC_START: &str = "migration_sync_start";
/// Task opening the pause progress entry.
pub const PAUSE_START: &str = "migration_pause_start";
/// Task opening the switch progress entry.
pub const SWITCH_START: &str = "migration_switch_start";
/// Task opening the abort progress entry.
pub const ABORT_START: &str = "migration_abort_start";
/// Task opening the rollback progress entry.
pub const ROLLBACK_START: &str = "migration_rollback_start";

fn indexes(job: &Job<Scratch>) -> BTreeMap<String, usize> {
    job.get_param(keys::MIGRATION_PROGRESS)
        .ok()
        .flatten()
        .unwrap_or_default()
}

/// Index of this job's progress entry for `phase`.
pub fn progress_index(job: &Job<Scratch>, phase: MigrationPhase) -> Option<usize> {
    indexes(job).get(phase.as_str()).copied()
}

/// Phase this job is currently working on.
pub fn current_phase(job: &Job<Scratch>) -> Option<MigrationPhase> {
    job.get_param(keys::MIGRATION_PHASE).ok().flatten()
}

/// Whether the entry at `index` was opened by this job.
pub fn owns_entry(job: &Job<Scratch>, record: &MigrationRecord, index: usize) -> bool {
    let job_uuid = job.id.to_string();
    record
        .progress_history
        .get(index)
        .is_some_and(|e| e.job_uuid.as_deref() == Some(job_uuid.as_str()))
}

/// Open a progress entry for `phase` on `record` (not stored yet).
///
/// Returns the entry index; the caller records it with [`remember`] once
/// the record is stored.
pub fn open(job: &Job<Scratch>, record: &mut MigrationRecord, phase: MigrationPhase) -> usize {
    record.phase = phase;
    record.state = MigrationState::Running;
    record.error = None;
    record.start_progress(phase, job.id.to_string(), format!("{} started", phase))
}

/// Record `index` as this job's entry for `phase`.
pub fn remember(job: &mut Job<Scratch>, phase: MigrationPhase, index: usize) -> Result<(), TaskError> {
    let mut map = indexes(job);
    map.insert(phase.as_str().to_string(), index);
    job.store_param(keys::MIGRATION_PROGRESS, &map)?;
    job.store_param(keys::MIGRATION_PHASE, &phase)
}

/// Queue a progress notice for the entry at `index`.
pub fn announce(svc: &Services, record: &MigrationRecord, index: usize) {
    let Some(entry) = record.progress_history.get(index) else {
        return;
    };
    svc.notify_progress(
        &record.vm_uuid,
        MigrationProgressEvent {
            phase: entry.phase.to_string(),
            state: entry.state.to_string(),
            message: entry.message.clone(),
            current_progress: entry.current_progress,
            total_progress: entry.total_progress,
            job_uuid: entry.job_uuid.clone(),
        },
    );
}

/// Open this job's entry for `phase`, unless an earlier attempt did.
pub async fn start_phase(job: &mut Job<Scratch>, svc: &Services, phase: MigrationPhase) -> TaskResult {
    let vm_uuid = super::vm_uuid(job)?;
    let action = super::action(job)?;
    let mut record = load_record(svc, &vm_uuid).await?;

    if let Some(index) = progress_index(job, phase)
        && owns_entry(job, &record, index)
    {
        return Ok(TaskOutcome::done(format!("{} already started", phase)));
    }

    if indexes(job).is_empty() {
        record.actions.push(action);
    }
    let index = open(job, &mut record, phase);
    store_record(svc, Some(&job.id.to_string()), &mut record).await?;
    remember(job, phase, index)?;
    announce(svc, &record, index);

    info!(job_id = %job.id, vm_uuid = %vm_uuid, phase = %phase, "Migration phase started");
    Ok(TaskOutcome::done(format!("{} started", phase)))
}

/// Close this job's entry for `phase` as successful and apply `update`.
pub async fn finish_phase<F>(
    job: &mut Job<Scratch>,
    svc: &Services,
    phase: MigrationPhase,
    message: &str,
    update: F,
) -> TaskResult
where
    F: FnOnce(&mut MigrationRecord),
{
    let vm_uuid = super::vm_uuid(job)?;
    let index = progress_index(job, phase).ok_or_else(|| {
        TaskError::validation(keys::MIGRATION_PROGRESS, format!("{} was never started", phase))
    })?;
    let mut record = load_record(svc, &vm_uuid).await?;

    if record
        .progress_history
        .get(index)
        .is_some_and(|e| e.state == ProgressState::Success)
    {
        return Ok(TaskOutcome::done(format!("{} already finished", phase)));
    }

    record.finish_progress(index, ProgressState::Success, message);
    update(&mut record);
    store_record(svc, Some(&job.id.to_string()), &mut record).await?;
    announce(svc, &record, index);

    info!(
        job_id = %job.id,
        vm_uuid = %vm_uuid,
        phase = %phase,
        state = %record.state,
        "Migration phase finished"
    );
    Ok(TaskOutcome::done(message.to_string()))
}

fn sync_start<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(start_phase(job, svc, MigrationPhase::Sync))
}

fn pause_start<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(start_phase(job, svc, MigrationPhase::Pause))
}

fn switch_start<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(start_phase(job, svc, MigrationPhase::Switch))
}

fn abort_start<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(start_phase(job, svc, MigrationPhase::Abort))
}

fn rollback_start<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(start_phase(job, svc, MigrationPhase::Rollback))
}

/// Register the phase start tasks.
pub fn register(registry: &mut TaskRegistry<Services>) -> Result<(), DefinitionError> {
    let starts: [(&str, vmflow_core::TaskFn<Scratch, Services>); 5] = [
        (SYNC_START, sync_start),
        (PAUSE_START, pause_start),
        (SWITCH_START, switch_start),
        (ABORT_START, abort_start),
        (ROLLBACK_START, rollback_start),
    ];
    for (name, body) in starts {
        registry.register(
            TaskDescriptor::new(name, body)
                .with_timeout(Duration::from_secs(30))
                .with_retry(3)
                .requires(capability::VMAPI),
        )?;
    }
    Ok(())
}
