// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recovery tasks for failed or cancelled migration jobs.
//!
//! Both tasks re-read everything they act on and never fail. Waits are
//! cut short before the task deadline so the chain reaches ticket release
//! with a `Done` outcome rather than a timeout.

use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};
use vmflow_clients::{AgentTaskStatus, VmState};
use vmflow_core::config::DEFAULT_REQUEST_TIMEOUT_MS;
use vmflow_core::{
    BoxFuture, DefinitionError, Job, TaskDescriptor, TaskError, TaskOutcome, TaskRegistry,
    TaskResult,
};

use super::progress;
use super::record::{MigrationPhase, MigrationRecord, MigrationState, ProgressState, load_record, store_record};
use super::switch::{reserved_this_run, unreserve};
use crate::keys;
use crate::scratch::Scratch;
use crate::services::{Services, capability};

/// Task recording the failure on the migration record.
pub const MIGRATION_FAILED: &str = "migration_failed";
/// Task undoing a partial switch.
pub const SWITCH_COMPENSATE: &str = "migration_switch_compensate";

const STORE_ATTEMPTS: u32 = 3;

/// Room for every attempt's load and store at the default request timeout,
/// plus one spare round trip.
const MIGRATION_FAILED_TIMEOUT: Duration =
    Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS * (2 * STORE_ATTEMPTS as u64 + 1));

/// Longest the source restart is waited for.
const SWITCH_COMPENSATE_TIMEOUT: Duration = Duration::from_secs(300);

/// Mark this job's entry for `phase` failed.
///
/// Returns `None` when the entry is not this job's running entry.
async fn mark_failed(
    job: &Job<Scratch>,
    svc: &Services,
    phase: MigrationPhase,
    index: usize,
    reason: &str,
) -> Result<Option<MigrationRecord>, TaskError> {
    let vm_uuid = super::vm_uuid(job)?;
    let mut record = load_record(svc, &vm_uuid).await?;

    let running = record
        .progress_history
        .get(index)
        .is_some_and(|e| e.state == ProgressState::Running);
    if !running || !progress::owns_entry(job, &record, index) {
        return Ok(None);
    }

    let disallow_retry = job.param_bool(keys::MIGRATION_DISALLOW_RETRY);
    record.finish_progress(index, ProgressState::Failed, reason);
    if let Some(entry) = record.progress_history.get_mut(index) {
        entry.error = Some(reason.to_string());
        entry.disallow_retry = disallow_retry;
    }
    record.state = MigrationState::Failed;
    record.error = Some(reason.to_string());
    if phase == MigrationPhase::Switch && !disallow_retry {
        record.phase = MigrationPhase::Sync;
    }

    store_record(svc, Some(&job.id.to_string()), &mut record).await?;
    Ok(Some(record))
}

fn migration_failed<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let Some(phase) = progress::current_phase(job) else {
            return Ok(TaskOutcome::done("No migration phase was started"));
        };
        let Some(index) = progress::progress_index(job, phase) else {
            return Ok(TaskOutcome::done(format!("No progress entry for {}", phase)));
        };
        let action = job
            .param_str(keys::MIGRATION_ACTION)
            .unwrap_or(phase.as_str())
            .to_string();
        let reason = format!(
            "{} failed: {}",
            action,
            job.last_error_message().unwrap_or("job cancelled")
        );

        let mut attempt = 0;
        loop {
            attempt += 1;
            match mark_failed(job, svc, phase, index, &reason).await {
                Ok(Some(record)) => {
                    progress::announce(svc, &record, index);
                    info!(
                        job_id = %job.id,
                        vm_uuid = %record.vm_uuid,
                        phase = %record.phase,
                        reason = %reason,
                        "Migration marked failed"
                    );
                    return Ok(TaskOutcome::done(reason));
                }
                Ok(None) => {
                    return Ok(TaskOutcome::done(format!(
                        "{} entry is not running under this job",
                        phase
                    )));
                }
                Err(e) if e.is_retryable() && attempt < STORE_ATTEMPTS => {
                    // A load and a store must both fit before the deadline
                    let round_trip = svc.config().request_timeout * 2;
                    if job.would_exceed_deadline(round_trip) {
                        warn!(job_id = %job.id, attempt, error = %e, "No time left to retry migration failure update");
                        return Ok(TaskOutcome::done(format!("Failure not recorded: {}", e)));
                    }
                    warn!(job_id = %job.id, attempt, error = %e, "Retrying migration failure update");
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Could not record migration failure");
                    return Ok(TaskOutcome::done(format!("Failure not recorded: {}", e)));
                }
            }
        }
    })
}

/// Poll again unless the next poll would run into the task deadline, in
/// which case the restart is left to the agent.
fn keep_waiting(job: &mut Job<Scratch>, svc: &Services, task_id: &str) -> TaskOutcome {
    let interval = svc.config().task_poll_interval;
    if job.would_exceed_deadline(interval * 2) {
        job.remove_param(keys::MIGRATION_RESTART_TASK);
        warn!(job_id = %job.id, agent_task = %task_id, "Source restart did not finish in time, leaving it to the agent");
        return TaskOutcome::done(format!("Source restart {} still running", task_id));
    }
    TaskOutcome::poll(interval, "Source restarting")
}

/// Poll the restart task started by an earlier invocation.
async fn poll_restart(job: &mut Job<Scratch>, svc: &Services, task_id: &str) -> TaskOutcome {
    match svc.cnapi().get_task(task_id).await {
        Ok(task) if task.status == AgentTaskStatus::Complete => {
            job.remove_param(keys::MIGRATION_RESTART_TASK);
            TaskOutcome::done("Source restarted")
        }
        Ok(task) if task.status == AgentTaskStatus::Failure => {
            job.remove_param(keys::MIGRATION_RESTART_TASK);
            let reason = task.error.unwrap_or_default();
            warn!(job_id = %job.id, agent_task = %task_id, error = %reason, "Source restart failed");
            TaskOutcome::done(format!("Source restart failed: {}", reason))
        }
        Ok(_) => keep_waiting(job, svc, task_id),
        Err(e) => {
            warn!(job_id = %job.id, agent_task = %task_id, error = %e, "Cannot poll source restart");
            TaskOutcome::done(format!("Source restart unknown: {}", e))
        }
    }
}

fn switch_compensate<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        if progress::current_phase(job) != Some(MigrationPhase::Switch) {
            return Ok(TaskOutcome::done("Switch never started"));
        }
        if let Some(task_id) = job.param_str(keys::MIGRATION_RESTART_TASK).map(str::to_string) {
            return Ok(poll_restart(job, svc, &task_id).await);
        }

        let ips = reserved_this_run(job);
        if !ips.is_empty() {
            match unreserve(job, svc, ips).await {
                Ok(n) => info!(job_id = %job.id, unreserved = n, "Switch reservations undone"),
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to undo switch reservations"),
            }
        }

        if !job.param_bool(keys::MIGRATION_VM_WAS_RUNNING) {
            return Ok(TaskOutcome::done("Source was not running"));
        }
        let (Ok(vm_uuid), Ok(source)) = (super::vm_uuid(job), super::source_server(job)) else {
            return Ok(TaskOutcome::done("Source unknown"));
        };
        let vm = match svc.cnapi().load_vm(&source, &vm_uuid).await {
            Ok(vm) => vm,
            Err(e) => {
                warn!(job_id = %job.id, vm_uuid = %vm_uuid, error = %e, "Cannot load source to restart it");
                return Ok(TaskOutcome::done(format!("Source not restarted: {}", e)));
            }
        };
        // A hidden source means the target has taken over
        if vm.do_not_inventory || vm.state == VmState::Running {
            return Ok(TaskOutcome::done(format!(
                "Source left as is ({}, hidden: {})",
                vm.state, vm.do_not_inventory
            )));
        }

        match svc.cnapi().vm_action(&source, &vm_uuid, "start", &json!({})).await {
            Ok(handle) => {
                info!(job_id = %job.id, vm_uuid = %vm_uuid, agent_task = %handle.id, "Restarting source");
                job.set_param(keys::MIGRATION_RESTART_TASK, handle.id.clone());
                Ok(keep_waiting(job, svc, &handle.id))
            }
            Err(e) => {
                warn!(job_id = %job.id, vm_uuid = %vm_uuid, error = %e, "Failed to restart source");
                Ok(TaskOutcome::done(format!("Source not restarted: {}", e)))
            }
        }
    })
}

/// Register the recovery tasks.
pub fn register(registry: &mut TaskRegistry<Services>) -> Result<(), DefinitionError> {
    registry.register(
        TaskDescriptor::new(MIGRATION_FAILED, migration_failed)
            .with_timeout(MIGRATION_FAILED_TIMEOUT)
            .requires(capability::VMAPI),
    )?;
    registry.register(
        TaskDescriptor::new(SWITCH_COMPENSATE, switch_compensate)
            .with_timeout(SWITCH_COMPENSATE_TIMEOUT)
            .requires(capability::CNAPI)
            .requires(capability::NAPI)
            .requires(capability::VMAPI),
    )?;
    Ok(())
}
