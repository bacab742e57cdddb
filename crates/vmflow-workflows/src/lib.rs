// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! vmflow Workflows - VM control-plane job definitions
//!
//! This crate registers the tasks that make up every VM workflow and
//! composes them into versioned definitions run by
//! [`vmflow_core::ChainExecutor`].
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use vmflow_core::{ChainExecutor, Config};
//! use vmflow_workflows::{Catalog, Services};
//!
//! let services = Services::from_config(Config::from_env()?)?;
//! let catalog = Catalog::build(&services)?;
//! let executor = ChainExecutor::new(Arc::new(services));
//!
//! let def = catalog.get("start").expect("catalog has start");
//! let mut params = serde_json::Map::new();
//! params.insert("vm_uuid".into(), "0b5f6ff1-...".into());
//! let handle = executor.spawn(def.clone(), def.new_job(params));
//! let job = handle.join().await?;
//! ```
//!
//! # Modules
//!
//! - [`tickets`]: Waitlist tickets serializing work per VM, network or scope
//! - [`zone_action`]: Dispatch an agent request, wait for it, verify the VM
//! - [`nics`]: NIC creation and removal
//! - [`fabric_nat`]: NAT instances for fabric networks
//! - [`migration`]: The live migration protocol
//! - [`workflows`]: The catalog of definitions
//! - [`services`]: Configuration and service clients handed to tasks

#![deny(missing_docs)]

/// Job parameter names.
pub mod keys;

/// Waitlist tickets.
pub mod tickets;

/// Zone-action task family.
pub mod zone_action;

/// NIC provisioning.
pub mod nics;

/// Fabric NAT provisioning.
pub mod fabric_nat;

/// Live migration.
pub mod migration;

/// Per-run scratch state.
pub mod scratch;

/// Execution context.
pub mod services;

/// Workflow catalog.
pub mod workflows;

pub use migration::{MigrationAction, MigrationPhase, MigrationRecord, MigrationState};
pub use scratch::Scratch;
pub use services::{ProgressNotice, ProgressSink, Services, capability};
pub use workflows::{Catalog, VERSION, registry};
pub use zone_action::{Expectation, ZoneMethod, ZoneRequest};
