// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Migration protocol tests: every action run against an in-memory fleet and
//! a fake migration process.

mod common;

use std::time::Duration;

use serde_json::json;
use vmflow_clients::{CnapiClient, NapiClient, VmState};
use vmflow_core::JobStatus;
use vmflow_workflows::MigrationAction;
use vmflow_workflows::migration::{MigrationPhase, MigrationState, ProgressState};

use common::*;

/// A fleet with the running VM on the source and a sync endpoint.
async fn setup() -> (Harness, FakeSyncServer) {
    let fleet = seeded_fleet().await;
    fleet.add_vm(running_vm()).await;
    let server = FakeSyncServer::start().await;
    server.install(&fleet).await;
    (Harness::new(fleet), server)
}

async fn run_ok(harness: &Harness, action: MigrationAction) {
    let job = harness.migrate(action, json!({})).await;
    assert_succeeded(&job);
}

// ============================================================================
// begin
// ============================================================================

#[tokio::test]
async fn test_begin_provisions_hidden_target() {
    let (harness, _server) = setup().await;
    let fleet = harness.fleet.clone();

    run_ok(&harness, MigrationAction::Begin).await;

    let record = harness.record().await;
    assert_eq!(record.phase, MigrationPhase::Begin);
    assert_eq!(record.state, MigrationState::Paused);
    assert_eq!(record.actions, vec![MigrationAction::Begin]);
    assert_eq!(record.source_server_uuid, CN_SOURCE);
    assert_eq!(record.target_server_uuid, CN_TARGET);
    assert!(record.vm_was_running);
    assert_eq!(record.progress_history.len(), 1);
    assert_eq!(record.progress_history[0].state, ProgressState::Success);

    let target = fleet.vm_on(CN_TARGET, VM_UUID).await.expect("target copy");
    assert!(target.do_not_inventory);
    assert!(target.vm_migration_target);
    assert!(!target.autoboot);
    assert_eq!(target.state, VmState::Stopped);

    let source = fleet.vm_on(CN_SOURCE, VM_UUID).await.unwrap();
    assert_eq!(source.state, VmState::Running);
    assert!(!source.do_not_inventory);

    let allocate: Vec<_> = fleet
        .tickets()
        .await
        .into_iter()
        .filter(|t| t.scope == "allocate")
        .collect();
    assert_eq!(allocate.len(), 1);
    assert_eq!(allocate[0].id, "migration");
    assert!(fleet.held_tickets().await.is_empty());
    assert!(fleet.migrate_requests().await.is_empty());

    let requests = fleet.allocation_requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].nic_tags, vec!["external"]);
    assert_eq!(requests[0].exclude_servers, vec![CN_SOURCE]);
}

#[tokio::test]
async fn test_begin_honours_override_server() {
    let (harness, _server) = setup().await;
    harness.fleet.add_server("cn-0003").await;

    let job = harness
        .migrate(MigrationAction::Begin, json!({ "override_server_uuid": "cn-0003" }))
        .await;
    assert_succeeded(&job);

    assert_eq!(harness.record().await.target_server_uuid, "cn-0003");
    assert!(harness.fleet.vm_on("cn-0003", VM_UUID).await.is_some());
}

#[tokio::test]
async fn test_begin_rejects_source_as_override() {
    let (harness, _server) = setup().await;

    let job = harness
        .migrate(MigrationAction::Begin, json!({ "override_server_uuid": CN_SOURCE }))
        .await;

    assert_failed_with(&job, "VALIDATION_ERROR");
    assert!(harness.fleet.migration(VM_UUID).await.is_none());
}

#[tokio::test]
async fn test_second_begin_is_rejected() {
    let (harness, _server) = setup().await;
    run_ok(&harness, MigrationAction::Begin).await;
    let before = harness.record().await;

    let job = harness.migrate(MigrationAction::Begin, json!({})).await;

    assert_failed_with(&job, "VALIDATION_ERROR");
    assert_eq!(harness.record().await, before);
    assert_eq!(harness.fleet.vm_copies(VM_UUID).await.len(), 2);
}

#[tokio::test]
async fn test_automatic_begin_queues_sync() {
    let (harness, _server) = setup().await;

    let job = harness
        .migrate(MigrationAction::Begin, json!({ "migration_automatic": true }))
        .await;
    assert_succeeded(&job);

    assert!(harness.record().await.automatic);
    assert_eq!(
        harness.fleet.migrate_requests().await,
        vec![(VM_UUID.to_string(), "sync".to_string())]
    );
}

// ============================================================================
// sync and switch
// ============================================================================

#[tokio::test]
async fn test_begin_sync_switch() {
    let (harness, server) = setup().await;
    let fleet = harness.fleet.clone();

    run_ok(&harness, MigrationAction::Begin).await;
    run_ok(&harness, MigrationAction::Sync).await;

    let record = harness.record().await;
    assert_eq!(record.phase, MigrationPhase::Sync);
    assert_eq!(record.state, MigrationState::Paused);
    assert_eq!(record.num_sync_phases, 1);
    assert!(record.source_process.is_none());
    assert!(record.target_process.is_none());
    let sync = record.progress_history.last().unwrap();
    assert_eq!(sync.phase, MigrationPhase::Sync);
    assert_eq!(sync.current_progress, 4096);
    assert_eq!(sync.total_progress, 4096);
    assert_eq!(server.commands(), vec!["set-record", "sync", "end", "stop", "stop"]);

    run_ok(&harness, MigrationAction::Switch).await;

    let record = harness.record().await;
    assert_eq!(record.phase, MigrationPhase::Switch);
    assert_eq!(record.state, MigrationState::Successful);
    assert_eq!(record.num_sync_phases, 1);
    assert!(record.finished_timestamp.is_some());
    assert!(record.reserved_network_ips.is_empty());
    assert_eq!(
        record.actions,
        vec![MigrationAction::Begin, MigrationAction::Sync, MigrationAction::Switch]
    );
    assert!(record.progress_history.last().unwrap().disallow_retry);

    let target = fleet.vm_on(CN_TARGET, VM_UUID).await.unwrap();
    assert!(!target.do_not_inventory);
    assert!(!target.vm_migration_target);
    assert_eq!(target.state, VmState::Running);
    assert!(target.indestructible_zoneroot);
    assert_eq!(target.quota, Some(25));

    let source = fleet.vm_on(CN_SOURCE, VM_UUID).await.unwrap();
    assert!(source.do_not_inventory);
    assert_eq!(source.state, VmState::Stopped);

    assert!(fleet.reserved_ips().await.is_empty());
    assert!(fleet.held_tickets().await.is_empty());
    assert_eq!(server.commands().len(), 10, "switch runs a final sync");
}

#[tokio::test]
async fn test_repeated_syncs_count_phases() {
    let (harness, server) = setup().await;
    run_ok(&harness, MigrationAction::Begin).await;

    run_ok(&harness, MigrationAction::Sync).await;
    assert_eq!(harness.record().await.num_sync_phases, 1);
    run_ok(&harness, MigrationAction::Sync).await;

    let record = harness.record().await;
    assert_eq!(record.num_sync_phases, 2);
    assert_eq!(record.state, MigrationState::Paused);
    assert!(record.error.is_none());
    assert_eq!(server.commands().iter().filter(|c| *c == "sync").count(), 2);
}

#[tokio::test]
async fn test_switch_requires_a_sync() {
    let (harness, _server) = setup().await;
    run_ok(&harness, MigrationAction::Begin).await;
    let before = harness.record().await;

    let job = harness.migrate(MigrationAction::Switch, json!({})).await;

    assert_failed_with(&job, "VALIDATION_ERROR");
    assert_eq!(job.error.as_ref().unwrap().task, "migration_validate");
    assert_eq!(harness.record().await, before);
    assert!(harness.fleet.held_tickets().await.is_empty());
}

#[tokio::test]
async fn test_full_migration() {
    let (harness, server) = setup().await;
    let fleet = harness.fleet.clone();

    run_ok(&harness, MigrationAction::Full).await;

    let record = harness.record().await;
    assert_eq!(record.actions, vec![MigrationAction::Full]);
    assert_eq!(record.phase, MigrationPhase::Switch);
    assert_eq!(record.state, MigrationState::Successful);
    assert_eq!(record.num_sync_phases, 1);
    let phases: Vec<_> = record.progress_history.iter().map(|e| e.phase).collect();
    assert_eq!(
        phases,
        vec![MigrationPhase::Begin, MigrationPhase::Sync, MigrationPhase::Switch]
    );
    assert!(
        record
            .progress_history
            .iter()
            .all(|e| e.state == ProgressState::Success)
    );

    assert!(!fleet.vm_on(CN_TARGET, VM_UUID).await.unwrap().do_not_inventory);
    assert!(fleet.vm_on(CN_SOURCE, VM_UUID).await.unwrap().do_not_inventory);
    assert_eq!(server.commands().iter().filter(|c| *c == "sync").count(), 2);
    assert!(fleet.held_tickets().await.is_empty());
}

#[tokio::test]
async fn test_start_runs_begin_and_one_sync() {
    let (harness, _server) = setup().await;

    run_ok(&harness, MigrationAction::Start).await;

    let record = harness.record().await;
    assert_eq!(record.actions, vec![MigrationAction::Start]);
    assert_eq!(record.phase, MigrationPhase::Sync);
    assert_eq!(record.state, MigrationState::Paused);
    assert_eq!(record.num_sync_phases, 1);
    let source = harness.fleet.vm_on(CN_SOURCE, VM_UUID).await.unwrap();
    assert_eq!(source.state, VmState::Running);
}

// ============================================================================
// failures
// ============================================================================

#[tokio::test]
async fn test_sync_failure_marks_record_failed() {
    let (harness, server) = setup().await;
    run_ok(&harness, MigrationAction::Begin).await;
    harness
        .fleet
        .fail_agent_action("migrate:sync", "zfs send failed")
        .await;

    let job = harness.migrate(MigrationAction::Sync, json!({})).await;
    assert_failed_with(&job, "AGENT_TASK_FAILED");

    let record = harness.record().await;
    assert_eq!(record.phase, MigrationPhase::Sync);
    assert_eq!(record.state, MigrationState::Failed);
    assert!(record.error.as_deref().unwrap().starts_with("sync failed"));
    let entry = record.progress_history.last().unwrap();
    assert_eq!(entry.state, ProgressState::Failed);
    assert!(entry.error.is_some());
    assert!(record.target_process.is_none(), "receiver stopped by cleanup");
    assert_eq!(server.commands(), vec!["stop"]);
    assert!(harness.fleet.held_tickets().await.is_empty());

    // A failed sync can be retried
    run_ok(&harness, MigrationAction::Sync).await;
    let record = harness.record().await;
    assert_eq!(record.state, MigrationState::Paused);
    assert_eq!(record.num_sync_phases, 1);
}

#[tokio::test]
async fn test_sync_protocol_error_fails_job() {
    let fleet = seeded_fleet().await;
    fleet.add_vm(running_vm()).await;
    let server = FakeSyncServer::failing("dataset busy").await;
    server.install(&fleet).await;
    let harness = Harness::new(fleet);
    run_ok(&harness, MigrationAction::Begin).await;

    let job = harness.migrate(MigrationAction::Sync, json!({})).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_ref().unwrap().task, "migration_run_sync");
    let record = harness.record().await;
    assert_eq!(record.state, MigrationState::Failed);
    assert!(record.error.as_deref().unwrap().contains("dataset busy"));
    assert!(record.source_process.is_none());
    assert!(record.target_process.is_none());
}

#[tokio::test]
async fn test_switch_failure_restarts_source() {
    let (harness, _server) = setup().await;
    let fleet = harness.fleet.clone();
    run_ok(&harness, MigrationAction::Begin).await;
    run_ok(&harness, MigrationAction::Sync).await;
    fleet.fail_agent_action("migrate:setup", "zfs receive failed").await;

    let job = harness.migrate(MigrationAction::Switch, json!({})).await;
    assert_failed_with(&job, "AGENT_TASK_FAILED");

    let record = harness.record().await;
    assert_eq!(record.state, MigrationState::Failed);
    assert_eq!(record.phase, MigrationPhase::Sync, "switch can be retried");
    assert!(record.error.as_deref().unwrap().starts_with("switch failed"));
    assert!(record.reserved_network_ips.is_empty());
    let entry = record.progress_history.last().unwrap();
    assert_eq!(entry.phase, MigrationPhase::Switch);
    assert_eq!(entry.state, ProgressState::Failed);
    assert!(!entry.disallow_retry);

    let source = fleet.vm_on(CN_SOURCE, VM_UUID).await.unwrap();
    assert_eq!(source.state, VmState::Running);
    assert!(!source.do_not_inventory);
    assert!(fleet.vm_on(CN_TARGET, VM_UUID).await.unwrap().do_not_inventory);
    assert!(fleet.reserved_ips().await.is_empty());
    assert!(fleet.held_tickets().await.is_empty());

    run_ok(&harness, MigrationAction::Switch).await;
    assert_eq!(harness.record().await.state, MigrationState::Successful);
}

#[tokio::test]
async fn test_switch_failure_with_stuck_restart_releases_ticket() {
    let (harness, _server) = setup().await;
    let fleet = harness.fleet.clone();
    run_ok(&harness, MigrationAction::Begin).await;
    run_ok(&harness, MigrationAction::Sync).await;

    // Agent tasks now outlive the source restart's wait
    tokio::time::pause();
    fleet.set_task_polls(70_000).await;
    fleet.fail_agent_action("migrate:receive", "receiver crashed").await;

    let job = harness.migrate(MigrationAction::Switch, json!({})).await;
    assert_failed_with(&job, "AGENT_TASK_FAILED");
    assert_eq!(job.error.as_ref().unwrap().task, "wait_task");

    let compensate = job.result_of("migration_switch_compensate").unwrap();
    assert!(compensate.error.is_none());
    assert!(compensate.result.contains("still running"));
    assert!(job.result_of("migration_failed").unwrap().error.is_none());
    assert!(job.result_of("release_held_tickets").unwrap().error.is_none());

    let record = harness.record().await;
    assert_eq!(record.state, MigrationState::Failed);
    assert_eq!(record.phase, MigrationPhase::Sync);
    assert!(record.error.as_deref().unwrap().contains("receiver crashed"));
    assert!(fleet.held_tickets().await.is_empty());
    assert!(fleet.reserved_ips().await.is_empty());
}

#[tokio::test]
async fn test_switch_failure_keeps_ips_reserved_before_switch() {
    let fleet = seeded_fleet().await;
    let mut vm = running_vm();
    vm.nics.push(nic("90:b8:d0:00:00:02", "10.88.0.6", &external_network(), VM_UUID));
    vm.nics[1].primary = false;
    fleet.add_vm(vm).await;
    NapiClient::set_ip_reserved(&fleet, EXTERNAL_NET, "10.88.0.6", true)
        .await
        .unwrap();
    let server = FakeSyncServer::start().await;
    server.install(&fleet).await;
    let harness = Harness::new(fleet.clone());

    run_ok(&harness, MigrationAction::Begin).await;
    run_ok(&harness, MigrationAction::Sync).await;
    fleet.fail_agent_action("migrate:setup", "zfs receive failed").await;

    let job = harness.migrate(MigrationAction::Switch, json!({})).await;
    assert_failed_with(&job, "AGENT_TASK_FAILED");

    // Only the address the switch reserved is given back
    assert_eq!(
        fleet.reserved_ips().await,
        vec![(EXTERNAL_NET.to_string(), "10.88.0.6".to_string())]
    );
    let record = harness.record().await;
    assert_eq!(record.state, MigrationState::Failed);
    assert!(record.reserved_network_ips.is_empty());
    assert!(fleet.held_tickets().await.is_empty());
}

// ============================================================================
// abort, rollback and pause
// ============================================================================

#[tokio::test]
async fn test_abort_after_begin() {
    let (harness, _server) = setup().await;
    let fleet = harness.fleet.clone();
    run_ok(&harness, MigrationAction::Begin).await;

    run_ok(&harness, MigrationAction::Abort).await;

    let record = harness.record().await;
    assert_eq!(record.phase, MigrationPhase::Abort);
    assert_eq!(record.state, MigrationState::Aborted);
    assert!(record.is_finished());

    assert!(fleet.vm_on(CN_TARGET, VM_UUID).await.is_none());
    let source = fleet.vm_on(CN_SOURCE, VM_UUID).await.unwrap();
    assert_eq!(source.state, VmState::Running);
    assert!(!source.do_not_inventory);
    assert!(fleet.held_tickets().await.is_empty());

    // A new migration may start once aborted
    run_ok(&harness, MigrationAction::Begin).await;
    assert_eq!(harness.record().await.actions, vec![MigrationAction::Begin]);
}

#[tokio::test]
async fn test_abort_refuses_promoted_target() {
    let (harness, _server) = setup().await;
    run_ok(&harness, MigrationAction::Begin).await;
    CnapiClient::vm_action(
        &harness.fleet,
        CN_TARGET,
        VM_UUID,
        "migrate",
        &json!({ "migration_task": "set_do_not_inventory", "value": false }),
    )
    .await
    .unwrap();
    let before = harness.record().await;

    let job = harness.migrate(MigrationAction::Abort, json!({})).await;

    assert_failed_with(&job, "VALIDATION_ERROR");
    assert!(
        job.last_error_message()
            .unwrap()
            .contains("Target instance does not have the do_not_inventory flag")
    );
    assert_eq!(harness.record().await, before);
    assert!(harness.fleet.vm_on(CN_TARGET, VM_UUID).await.is_some());
}

#[tokio::test]
async fn test_abort_after_sync_removes_sync_snapshots() {
    let (harness, _server) = setup().await;
    let fleet = harness.fleet.clone();
    run_ok(&harness, MigrationAction::Begin).await;
    run_ok(&harness, MigrationAction::Sync).await;
    assert!(!fleet.vm_on(CN_SOURCE, VM_UUID).await.unwrap().snapshots.is_empty());

    run_ok(&harness, MigrationAction::Abort).await;

    assert!(fleet.vm_on(CN_SOURCE, VM_UUID).await.unwrap().snapshots.is_empty());
    assert!(fleet.vm_on(CN_TARGET, VM_UUID).await.is_none());
}

#[tokio::test]
async fn test_rollback_after_switch() {
    let (harness, _server) = setup().await;
    let fleet = harness.fleet.clone();
    run_ok(&harness, MigrationAction::Begin).await;
    run_ok(&harness, MigrationAction::Sync).await;
    run_ok(&harness, MigrationAction::Switch).await;

    run_ok(&harness, MigrationAction::Rollback).await;

    let record = harness.record().await;
    assert_eq!(record.phase, MigrationPhase::Rollback);
    assert_eq!(record.state, MigrationState::Successful);
    assert!(record.is_finished());

    let source = fleet.vm_on(CN_SOURCE, VM_UUID).await.unwrap();
    assert!(!source.do_not_inventory);
    assert_eq!(source.state, VmState::Running);
    assert!(fleet.vm_on(CN_TARGET, VM_UUID).await.is_none());
    assert!(fleet.held_tickets().await.is_empty());
}

#[tokio::test]
async fn test_rollback_requires_successful_switch() {
    let (harness, _server) = setup().await;
    run_ok(&harness, MigrationAction::Begin).await;

    let job = harness.migrate(MigrationAction::Rollback, json!({})).await;

    assert_failed_with(&job, "VALIDATION_ERROR");
    assert!(harness.fleet.vm_on(CN_TARGET, VM_UUID).await.is_some());
}

#[tokio::test]
async fn test_pause_without_running_sync_fails() {
    let (harness, _server) = setup().await;
    run_ok(&harness, MigrationAction::Begin).await;

    let job = harness.migrate(MigrationAction::Pause, json!({})).await;

    assert_failed_with(&job, "VALIDATION_ERROR");
    assert!(harness.fleet.cancelled_jobs().await.is_empty());
    assert_eq!(harness.record().await.state, MigrationState::Paused);
}

#[tokio::test]
async fn test_pause_interrupts_running_sync() {
    let (harness, server) = setup().await;
    run_ok(&harness, MigrationAction::Begin).await;

    // Simulate a sync job in flight
    let mut record = harness.record().await;
    record.start_progress(MigrationPhase::Sync, "sync-job-1", "sync started");
    record.phase = MigrationPhase::Sync;
    record.state = MigrationState::Running;
    record.source_process = Some(server.process.clone());
    record.target_process = Some(server.process.clone());
    harness
        .fleet
        .put_migration(VM_UUID, serde_json::to_value(&record).unwrap())
        .await;

    run_ok(&harness, MigrationAction::Pause).await;

    assert_eq!(harness.fleet.cancelled_jobs().await, vec!["sync-job-1"]);
    assert_eq!(server.commands(), vec!["stop", "stop"]);

    let record = harness.record().await;
    assert_eq!(record.phase, MigrationPhase::Pause);
    assert_eq!(record.state, MigrationState::Paused);
    assert!(record.running_entries(MigrationPhase::Sync).is_empty());
    assert!(record.source_process.is_none());
    assert_eq!(record.actions.last(), Some(&MigrationAction::Pause));

    // Sync resumes from a pause
    run_ok(&harness, MigrationAction::Sync).await;
    assert_eq!(harness.record().await.num_sync_phases, 1);
}

// ============================================================================
// progress
// ============================================================================

#[tokio::test]
async fn test_progress_events_are_posted() {
    let fleet = seeded_fleet().await;
    fleet.add_vm(running_vm()).await;
    let server = FakeSyncServer::start().await;
    server.install(&fleet).await;
    let harness = Harness::with_progress(fleet.clone());

    run_ok(&harness, MigrationAction::Begin).await;
    run_ok(&harness, MigrationAction::Sync).await;
    harness.flush_progress().await;

    let events = fleet.progress_events().await;
    assert!(events.iter().all(|(vm, _)| vm == VM_UUID));

    let states: Vec<(&str, &str)> = events
        .iter()
        .map(|(_, e)| (e.phase.as_str(), e.state.as_str()))
        .collect();
    assert!(states.contains(&("begin", "running")));
    assert!(states.contains(&("begin", "success")));
    assert!(states.contains(&("sync", "success")));
    assert!(
        events
            .iter()
            .any(|(_, e)| e.phase == "sync" && e.current_progress == 1024 && e.total_progress == 4096)
    );
}

#[tokio::test]
async fn test_sync_progress_is_persisted_while_running() {
    let fleet = seeded_fleet().await;
    fleet.add_vm(running_vm()).await;
    let server = FakeSyncServer::held().await;
    server.install(&fleet).await;
    let harness = Harness::new(fleet.clone());
    run_ok(&harness, MigrationAction::Begin).await;

    let (def, job) = harness
        .catalog
        .migration_job(MigrationAction::Sync, VM_UUID, params(json!({})))
        .unwrap();
    let handle = harness.executor.spawn(def, job);

    let midway = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let record = harness.record().await;
            let entry = record.progress_history.last().unwrap().clone();
            if entry.phase == MigrationPhase::Sync && entry.current_progress > 0 {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("progress written before the sync ends");
    assert_eq!(midway.state, ProgressState::Running);
    assert_eq!(midway.current_progress, 1024);
    assert_eq!(midway.total_progress, 4096);

    server.resume();
    let job = handle.join().await.unwrap();
    assert_succeeded(&job);

    let entry = harness.record().await.progress_history.last().unwrap().clone();
    assert_eq!(entry.state, ProgressState::Success);
    assert_eq!(entry.current_progress, 4096);
}
