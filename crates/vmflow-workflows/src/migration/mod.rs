// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live migration of a VM between compute nodes.
//!
//! A migration is a sequence of actions, each run by its own job:
//!
//! | Action     | Effect                                                        |
//! |------------|---------------------------------------------------------------|
//! | `begin`    | place and provision a hidden target copy                      |
//! | `sync`     | copy filesystem data from source to target                    |
//! | `pause`    | interrupt a running sync                                      |
//! | `switch`   | stop the source, final sync, promote the target               |
//! | `abort`    | delete the target                                             |
//! | `rollback` | promote the source back after a switch                        |
//! | `full`     | `begin`, `sync` and `switch` in one job                       |
//! | `start`    | `begin` followed by one `sync`                                |
//!
//! Progress is persisted in a [`MigrationRecord`] stored with
//! compare-and-swap, so every task that changes it reads it first.

pub mod abort;
pub mod begin;
pub mod pause;
pub mod progress;
pub mod protocol;
pub mod record;
pub mod recovery;
pub mod rollback;
pub mod switch;
pub mod sync;
pub mod validate;

pub use protocol::{SyncConnection, SyncProtocolError};
pub use record::{
    MigrationAction, MigrationPhase, MigrationRecord, MigrationState, ProgressEntry,
    ProgressState, ReservedIp,
};

use vmflow_core::{DefinitionError, Job, TaskError, TaskRegistry};

use crate::keys;
use crate::scratch::Scratch;
use crate::services::Services;

pub(crate) fn action(job: &Job<Scratch>) -> Result<MigrationAction, TaskError> {
    job.require_str(keys::MIGRATION_ACTION)?.parse()
}

pub(crate) fn vm_uuid(job: &Job<Scratch>) -> Result<String, TaskError> {
    Ok(job.require_str(keys::VM_UUID)?.to_string())
}

pub(crate) fn source_server(job: &Job<Scratch>) -> Result<String, TaskError> {
    Ok(job.require_str(keys::SERVER_UUID)?.to_string())
}

pub(crate) fn target_server(job: &Job<Scratch>) -> Result<String, TaskError> {
    Ok(job.require_str(keys::TARGET_SERVER_UUID)?.to_string())
}

/// Register every migration task.
pub fn register(registry: &mut TaskRegistry<Services>) -> Result<(), DefinitionError> {
    validate::register(registry)?;
    progress::register(registry)?;
    begin::register(registry)?;
    sync::register(registry)?;
    pause::register(registry)?;
    switch::register(registry)?;
    abort::register(registry)?;
    rollback::register(registry)?;
    recovery::register(registry)?;
    Ok(())
}
