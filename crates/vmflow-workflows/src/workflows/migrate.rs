// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chains of the `migrate-*` workflows.
//!
//! Each action is assembled from shared segments so `full` and `start`
//! run exactly the tasks their standalone counterparts run, minus the
//! repeated validation and ticketing.

use vmflow_core::{DefinitionError, TaskRegistry, WorkflowDefinition};

use super::VERSION;
use crate::migration::{
    MigrationAction, abort, begin, pause, progress, recovery, rollback, switch, sync, validate,
};
use crate::services::Services;
use crate::tickets::{ACQUIRE_VM_TICKET, RELEASE_HELD_TICKETS, WAIT_VM_TICKET};
use crate::zone_action::{CHECK_STATE, WAIT_TASK, ZONE_ACTION};

const VM_TICKET: &[&str] = &[ACQUIRE_VM_TICKET, WAIT_VM_TICKET];

const ALLOCATE: &[&str] = &[
    begin::ACQUIRE_ALLOCATION_TICKET,
    begin::WAIT_ALLOCATION_TICKET,
    begin::ALLOCATE_TARGET,
    begin::RELEASE_ALLOCATION_TICKET,
];

const PROVISION_TARGET: &[&str] = &[
    begin::CREATE_RECORD,
    begin::SETUP_PROVISION_TARGET,
    ZONE_ACTION,
    WAIT_TASK,
    CHECK_STATE,
    begin::BEGIN_FINISH,
];

/// Start both agent processes and copy data between them.
const SYNC_PASS: &[&str] = &[
    sync::SETUP_RECEIVE,
    ZONE_ACTION,
    WAIT_TASK,
    sync::STORE_TARGET_PROCESS,
    sync::SETUP_SEND,
    ZONE_ACTION,
    WAIT_TASK,
    sync::STORE_SOURCE_PROCESS,
    sync::RUN_SYNC,
    sync::CLEANUP_SYNC_PROCESSES,
];

const SWITCH_PREPARE: &[&str] = &[
    progress::SWITCH_START,
    switch::SETUP_STOP_SOURCE,
    ZONE_ACTION,
    WAIT_TASK,
    CHECK_STATE,
];

const SWITCH_PROMOTE: &[&str] = &[
    switch::RESERVE_TARGET_IPS,
    switch::SETUP_TARGET_FILESYSTEM,
    ZONE_ACTION,
    WAIT_TASK,
    switch::SETUP_HIDE_SOURCE,
    ZONE_ACTION,
    WAIT_TASK,
    switch::SETUP_SHOW_TARGET,
    ZONE_ACTION,
    WAIT_TASK,
    switch::DISALLOW_RETRY,
    switch::SETUP_RESTORE_TARGET_PROPERTIES,
    ZONE_ACTION,
    WAIT_TASK,
    switch::UNRESERVE_IPS,
    switch::SETUP_START_TARGET,
    ZONE_ACTION,
    WAIT_TASK,
    CHECK_STATE,
    switch::SWITCH_FINISH,
];

const ABORT: &[&str] = &[
    progress::ABORT_START,
    switch::UNRESERVE_IPS,
    switch::DISALLOW_RETRY,
    abort::SETUP_DESTROY_TARGET,
    ZONE_ACTION,
    WAIT_TASK,
    CHECK_STATE,
    abort::SETUP_REMOVE_SYNC_SNAPSHOTS,
    ZONE_ACTION,
    WAIT_TASK,
    abort::ABORT_FINISH,
];

const ROLLBACK: &[&str] = &[
    progress::ROLLBACK_START,
    rollback::SETUP_STOP_TARGET,
    ZONE_ACTION,
    WAIT_TASK,
    CHECK_STATE,
    rollback::SETUP_HIDE_TARGET,
    ZONE_ACTION,
    WAIT_TASK,
    rollback::SETUP_SHOW_SOURCE,
    ZONE_ACTION,
    WAIT_TASK,
    rollback::SETUP_RESTORE_SOURCE_PROPERTIES,
    ZONE_ACTION,
    WAIT_TASK,
    abort::SETUP_DESTROY_TARGET,
    ZONE_ACTION,
    WAIT_TASK,
    CHECK_STATE,
    rollback::SETUP_START_SOURCE,
    ZONE_ACTION,
    WAIT_TASK,
    CHECK_STATE,
    rollback::ROLLBACK_FINISH,
];

/// Main chain for `action`.
pub fn chain(action: MigrationAction) -> Vec<&'static str> {
    let mut tasks = vec![validate::VALIDATE_MIGRATION];
    let sync_phase = [&[progress::SYNC_START][..], SYNC_PASS, &[sync::SYNC_FINISH]].concat();

    match action {
        MigrationAction::Begin => {
            tasks.extend_from_slice(ALLOCATE);
            tasks.extend_from_slice(VM_TICKET);
            tasks.extend_from_slice(PROVISION_TARGET);
            tasks.push(RELEASE_HELD_TICKETS);
            tasks.push(begin::KICK_OFF);
        }
        MigrationAction::Sync => {
            tasks.extend_from_slice(VM_TICKET);
            tasks.extend(sync_phase);
            tasks.push(RELEASE_HELD_TICKETS);
            tasks.push(begin::KICK_OFF);
        }
        MigrationAction::Pause => {
            tasks.extend_from_slice(&[
                progress::PAUSE_START,
                pause::CANCEL_SYNC_JOB,
                pause::STOP_SYNC_PROCESSES,
                pause::PAUSE_FINISH,
            ]);
        }
        MigrationAction::Switch => {
            tasks.extend_from_slice(VM_TICKET);
            tasks.extend_from_slice(SWITCH_PREPARE);
            tasks.extend_from_slice(SYNC_PASS);
            tasks.extend_from_slice(SWITCH_PROMOTE);
            tasks.push(RELEASE_HELD_TICKETS);
        }
        MigrationAction::Abort => {
            tasks.extend_from_slice(VM_TICKET);
            tasks.extend_from_slice(ABORT);
            tasks.push(RELEASE_HELD_TICKETS);
        }
        MigrationAction::Rollback => {
            tasks.extend_from_slice(VM_TICKET);
            tasks.extend_from_slice(ROLLBACK);
            tasks.push(RELEASE_HELD_TICKETS);
        }
        MigrationAction::Full => {
            tasks.extend_from_slice(ALLOCATE);
            tasks.extend_from_slice(VM_TICKET);
            tasks.extend_from_slice(PROVISION_TARGET);
            tasks.extend(sync_phase);
            tasks.extend_from_slice(SWITCH_PREPARE);
            tasks.extend_from_slice(SYNC_PASS);
            tasks.extend_from_slice(SWITCH_PROMOTE);
            tasks.push(RELEASE_HELD_TICKETS);
        }
        MigrationAction::Start => {
            tasks.extend_from_slice(ALLOCATE);
            tasks.extend_from_slice(VM_TICKET);
            tasks.extend_from_slice(PROVISION_TARGET);
            tasks.extend(sync_phase);
            tasks.push(RELEASE_HELD_TICKETS);
        }
    }
    tasks
}

/// Recovery chain shared by `onerror` and `oncancel`.
pub fn recovery(action: MigrationAction) -> Vec<&'static str> {
    match action {
        MigrationAction::Switch | MigrationAction::Full => vec![
            recovery::SWITCH_COMPENSATE,
            recovery::MIGRATION_FAILED,
            sync::CLEANUP_SYNC_PROCESSES,
            RELEASE_HELD_TICKETS,
        ],
        MigrationAction::Sync | MigrationAction::Start => vec![
            recovery::MIGRATION_FAILED,
            sync::CLEANUP_SYNC_PROCESSES,
            RELEASE_HELD_TICKETS,
        ],
        _ => vec![recovery::MIGRATION_FAILED, RELEASE_HELD_TICKETS],
    }
}

/// Build the definition running `action`.
pub fn define(
    registry: &TaskRegistry<Services>,
    services: &Services,
    action: MigrationAction,
) -> Result<WorkflowDefinition<Services>, DefinitionError> {
    registry
        .workflow(action.workflow_name(), VERSION)
        .chain(&chain(action))
        .onerror(&recovery(action))
        .build(services)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(chain: &[&str], task: &str) -> usize {
        chain.iter().position(|t| *t == task).unwrap()
    }

    #[test]
    fn test_every_chain_validates_first() {
        for action in MigrationAction::ALL {
            assert_eq!(chain(action)[0], validate::VALIDATE_MIGRATION, "{}", action);
        }
    }

    #[test]
    fn test_switch_hides_source_before_showing_target() {
        let tasks = chain(MigrationAction::Switch);
        assert!(position(&tasks, switch::SETUP_HIDE_SOURCE) < position(&tasks, switch::SETUP_SHOW_TARGET));
        assert!(position(&tasks, switch::SETUP_SHOW_TARGET) < position(&tasks, switch::DISALLOW_RETRY));
        assert!(position(&tasks, switch::RESERVE_TARGET_IPS) < position(&tasks, switch::UNRESERVE_IPS));
    }

    #[test]
    fn test_full_validates_once() {
        let tasks = chain(MigrationAction::Full);
        let validations = tasks
            .iter()
            .filter(|t| **t == validate::VALIDATE_MIGRATION)
            .count();
        assert_eq!(validations, 1);
        assert!(!tasks.contains(&begin::KICK_OFF));
        assert!(position(&tasks, sync::SYNC_FINISH) < position(&tasks, progress::SWITCH_START));
    }

    #[test]
    fn test_every_recovery_releases_tickets_last() {
        for action in MigrationAction::ALL {
            assert_eq!(recovery(action).last(), Some(&RELEASE_HELD_TICKETS), "{}", action);
        }
        assert_eq!(recovery(MigrationAction::Switch)[0], recovery::SWITCH_COMPENSATE);
    }
}
