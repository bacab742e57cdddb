// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `sync`: copy the VM's datasets from source to target.
//!
//! The agent starts a receiving process on the target and a sending process
//! on the source. This job then drives the sender over the sync protocol:
//! `set-record`, `sync` (pointed at the receiver) and `end`. Progress is
//! written to the record every `sync_progress_interval` while data moves.

use serde_json::json;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{info, warn};
use vmflow_clients::AgentProcess;
use vmflow_core::{
    BoxFuture, DefinitionError, Job, TaskDescriptor, TaskError, TaskOutcome, TaskRegistry,
    TaskResult,
};

use super::progress;
use super::protocol::{SyncConnection, request_stop};
use super::record::{
    MigrationAction, MigrationPhase, MigrationState, ProgressState, load_record, store_record,
};
use crate::keys;
use crate::scratch::Scratch;
use crate::services::{Services, capability};
use crate::zone_action::{self, ZoneRequest};

/// Task preparing the request that starts the receiver on the target.
pub const SETUP_RECEIVE: &str = "migration_setup_receive";
/// Task recording the receiver's endpoint.
pub const STORE_TARGET_PROCESS: &str = "migration_store_target_process";
/// Task preparing the request that starts the sender on the source.
pub const SETUP_SEND: &str = "migration_setup_send";
/// Task recording the sender's endpoint.
pub const STORE_SOURCE_PROCESS: &str = "migration_store_source_process";
/// Task driving the sender.
pub const RUN_SYNC: &str = "migration_run_sync";
/// Task stopping leftover sync processes.
pub const CLEANUP_SYNC_PROCESSES: &str = "migration_cleanup_sync_processes";
/// Task closing the sync progress entry.
pub const SYNC_FINISH: &str = "migration_sync_finish";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

fn setup_receive<'a>(job: &'a mut Job<Scratch>, _svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let target = super::target_server(job)?;
        let migration_id = job.require_str(keys::MIGRATION_ID)?.to_string();

        let request = ZoneRequest::migrate(
            &target,
            &vm_uuid,
            "receive",
            json!({ "migration_id": migration_id }),
        );
        zone_action::prepare(job, request, false);
        Ok(TaskOutcome::done(format!("Starting receiver on {}", target)))
    })
}

fn setup_send<'a>(job: &'a mut Job<Scratch>, _svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let source = super::source_server(job)?;
        let migration_id = job.require_str(keys::MIGRATION_ID)?.to_string();

        let request = ZoneRequest::migrate(
            &source,
            &vm_uuid,
            "sync",
            json!({ "migration_id": migration_id }),
        );
        zone_action::prepare(job, request, false);
        Ok(TaskOutcome::done(format!("Starting sender on {}", source)))
    })
}

fn started_process(job: &Job<Scratch>) -> Result<AgentProcess, TaskError> {
    job.get_param(keys::ZONE_ACTION_RESULT)?.ok_or_else(|| {
        TaskError::validation(
            keys::ZONE_ACTION_RESULT,
            "agent did not report the migration process",
        )
    })
}

fn store_target_process<'a>(
    job: &'a mut Job<Scratch>,
    svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let process = started_process(job)?;
        let mut record = load_record(svc, &super::vm_uuid(job)?).await?;
        record.target_process = Some(process.clone());
        store_record(svc, Some(&job.id.to_string()), &mut record).await?;
        Ok(TaskOutcome::done(format!(
            "Receiver listening on {}:{} (pid {})",
            process.host, process.port, process.pid
        )))
    })
}

fn store_source_process<'a>(
    job: &'a mut Job<Scratch>,
    svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let process = started_process(job)?;
        let mut record = load_record(svc, &super::vm_uuid(job)?).await?;
        record.source_process = Some(process.clone());
        store_record(svc, Some(&job.id.to_string()), &mut record).await?;
        Ok(TaskOutcome::done(format!(
            "Sender listening on {}:{} (pid {})",
            process.host, process.port, process.pid
        )))
    })
}

/// Write `transferred` into this job's running sync entry.
///
/// The record is re-read so concurrent updates survive. Returns whether an
/// entry was updated.
async fn record_progress(
    svc: &Services,
    vm_uuid: &str,
    job_uuid: &str,
    index: Option<usize>,
    transferred: (u64, u64),
    message: &str,
) -> Result<bool, TaskError> {
    let mut record = load_record(svc, vm_uuid).await?;
    let Some(entry) = index.and_then(|i| record.progress_history.get_mut(i)) else {
        return Ok(false);
    };
    if entry.state != ProgressState::Running {
        return Ok(false);
    }
    entry.current_progress = transferred.0;
    entry.total_progress = transferred.1;
    entry.message = message.to_string();
    store_record(svc, Some(job_uuid), &mut record).await?;
    Ok(true)
}

fn run_sync<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = super::vm_uuid(job)?;
        let phase = progress::current_phase(job).unwrap_or(MigrationPhase::Sync);
        let index = progress::progress_index(job, phase);
        let record = load_record(svc, &vm_uuid).await?;

        let (Some(source), Some(target)) = (record.source_process.clone(), record.target_process.clone())
        else {
            return Err(TaskError::validation(
                "migration",
                "sync processes have not been started",
            ));
        };
        let snapshot = serde_json::to_value(&record).map_err(|e| {
            TaskError::validation("migration", format!("cannot serialize record: {}", e))
        })?;

        let mut conn = SyncConnection::connect(&source, CONNECT_TIMEOUT).await?;
        conn.command("set-record", json!({ "record": snapshot }), |_, _| {})
            .await?;

        let job_uuid = job.id.to_string();
        let (progress_tx, mut progress_rx) = watch::channel((0u64, 0u64));
        let synced = {
            let sync = conn.command(
                "sync",
                json!({ "host": target.host, "port": target.port }),
                |current, total| {
                    progress_tx.send_replace((current, total));
                    svc.notify_progress(
                        &vm_uuid,
                        vmflow_clients::MigrationProgressEvent {
                            phase: phase.to_string(),
                            state: "running".to_string(),
                            message: "syncing data".to_string(),
                            current_progress: current,
                            total_progress: total,
                            job_uuid: Some(job_uuid.clone()),
                        },
                    );
                },
            );
            tokio::pin!(sync);

            let every = svc.config().sync_progress_interval;
            let mut ticker = time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    result = &mut sync => break result,
                    _ = ticker.tick() => {
                        if !progress_rx.has_changed().unwrap_or(false) {
                            continue;
                        }
                        let transferred = *progress_rx.borrow_and_update();
                        // A missed write only delays what observers see
                        if let Err(e) =
                            record_progress(svc, &vm_uuid, &job_uuid, index, transferred, "syncing data").await
                        {
                            warn!(job_id = %job_uuid, vm_uuid = %vm_uuid, error = %e, "Failed to persist sync progress");
                        }
                    }
                }
            }
        };
        synced?;
        conn.command("end", json!({}), |_, _| {}).await?;

        let transferred = *progress_rx.borrow();
        record_progress(svc, &vm_uuid, &job_uuid, index, transferred, "sync complete").await?;

        info!(
            job_id = %job.id,
            vm_uuid = %vm_uuid,
            transferred = transferred.0,
            total = transferred.1,
            "Sync complete"
        );
        Ok(TaskOutcome::done(format!(
            "Synced {} of {} bytes",
            transferred.0, transferred.1
        )))
    })
}

/// Stop the recorded sync processes and forget them. Never fails.
pub(crate) async fn stop_processes(job: &Job<Scratch>, svc: &Services, kill: bool) -> String {
    let vm_uuid = match super::vm_uuid(job) {
        Ok(vm_uuid) => vm_uuid,
        Err(e) => return format!("Nothing to stop: {}", e),
    };
    let mut record = match load_record(svc, &vm_uuid).await {
        Ok(record) => record,
        Err(e) => {
            warn!(job_id = %job.id, vm_uuid = %vm_uuid, error = %e, "Cannot load record to stop sync processes");
            return format!("Record unavailable: {}", e);
        }
    };

    let processes = [
        (record.source_server_uuid.clone(), record.source_process.take()),
        (record.target_server_uuid.clone(), record.target_process.take()),
    ];
    if processes.iter().all(|(_, p)| p.is_none()) {
        return "No sync processes recorded".to_string();
    }
    let mut stopped = 0;
    for (server_uuid, process) in processes {
        let Some(process) = process else {
            continue;
        };
        match request_stop(&process, svc.config().sync_stop_timeout).await {
            Ok(()) => stopped += 1,
            Err(e) => {
                warn!(job_id = %job.id, pid = process.pid, server_uuid = %server_uuid, error = %e, "Migration process did not stop");
                if kill {
                    let payload = json!({ "migration_task": "kill_migration_process", "pid": process.pid });
                    if let Err(e) = svc.cnapi().vm_action(&server_uuid, &vm_uuid, "migrate", &payload).await {
                        warn!(job_id = %job.id, pid = process.pid, error = %e, "Failed to kill migration process");
                    }
                }
            }
        }
    }

    if let Err(e) = store_record(svc, Some(&job.id.to_string()), &mut record).await {
        warn!(job_id = %job.id, vm_uuid = %vm_uuid, error = %e, "Failed to clear sync processes");
    }
    format!("Stopped {} sync processes", stopped)
}

fn cleanup_sync_processes<'a>(
    job: &'a mut Job<Scratch>,
    svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move { Ok(TaskOutcome::done(stop_processes(job, svc, false).await)) })
}

fn sync_finish<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let action = super::action(job)?;
        progress::finish_phase(job, svc, MigrationPhase::Sync, "sync complete", |r| {
            r.num_sync_phases += 1;
            r.state = if action == MigrationAction::Full {
                MigrationState::Running
            } else {
                MigrationState::Paused
            };
        })
        .await
    })
}

/// Register the sync tasks.
pub fn register(registry: &mut TaskRegistry<Services>) -> Result<(), DefinitionError> {
    registry.register(
        TaskDescriptor::new(SETUP_RECEIVE, setup_receive)
            .with_timeout(Duration::from_secs(10))
            .requires(capability::CNAPI),
    )?;
    registry.register(
        TaskDescriptor::new(STORE_TARGET_PROCESS, store_target_process)
            .with_timeout(Duration::from_secs(30))
            .with_retry(3)
            .requires(capability::VMAPI),
    )?;
    registry.register(
        TaskDescriptor::new(SETUP_SEND, setup_send)
            .with_timeout(Duration::from_secs(10))
            .requires(capability::CNAPI),
    )?;
    registry.register(
        TaskDescriptor::new(STORE_SOURCE_PROCESS, store_source_process)
            .with_timeout(Duration::from_secs(30))
            .with_retry(3)
            .requires(capability::VMAPI),
    )?;
    registry.register(
        TaskDescriptor::new(RUN_SYNC, run_sync)
            .with_timeout(Duration::from_secs(24 * 3600))
            .requires(capability::SYNC)
            .requires(capability::VMAPI),
    )?;
    registry.register(
        TaskDescriptor::new(CLEANUP_SYNC_PROCESSES, cleanup_sync_processes)
            .with_timeout(Duration::from_secs(120))
            .requires(capability::SYNC)
            .requires(capability::VMAPI),
    )?;
    registry.register(
        TaskDescriptor::new(SYNC_FINISH, sync_finish)
            .with_timeout(Duration::from_secs(30))
            .with_retry(3)
            .requires(capability::VMAPI),
    )?;
    Ok(())
}
