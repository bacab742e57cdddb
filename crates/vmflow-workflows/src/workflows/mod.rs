// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The workflow catalog.
//!
//! Every workflow is one versioned definition composed from registered
//! task names. Workflows that take a VM ticket release it on the main,
//! `onerror` and `oncancel` chains alike.
//!
//! | Workflow | Main chain |
//! |----------|------------|
//! | `provision` | validate, allocate, ticket, NICs, fabric NATs, create, verify |
//! | `destroy` | ticket, destroy, verify, delete NICs, destroy fabric NATs |
//! | `start`, `stop` | ticket, power action, verify state |
//! | `reboot`, `update` | ticket, action, verify `last_modified` |
//! | `add-nics` | ticket, NICs, fabric NATs, plug, verify |
//! | `remove-nics` | ticket, unplug, verify, delete NICs, destroy fabric NATs |
//! | `snapshot`, `rollback`, `delete-snapshot` | action, verify |
//! | `migrate-*` | see [`crate::migration`] |

pub mod migrate;
pub mod nics;
pub mod snapshot;
pub mod vm;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use vmflow_core::{DefinitionError, Job, TaskRegistry, WorkflowDefinition};

use crate::fabric_nat::{
    ACQUIRE_FABRIC_NAT_TICKETS, DESTROY_FABRIC_NATS, PROVISION_FABRIC_NATS,
    WAIT_FABRIC_NAT_TICKETS, WAIT_FABRIC_NATS,
};
use crate::keys;
use crate::migration::MigrationAction;
use crate::nics::{DELETE_NICS, PROVISION_NICS, REMOVE_ADDED_NICS};
use crate::scratch::Scratch;
use crate::services::Services;
use crate::tickets::{ACQUIRE_VM_TICKET, RELEASE_HELD_TICKETS, WAIT_VM_TICKET};
use crate::zone_action::{
    CHECK_PROPAGATED, CHECK_STATE, CHECK_UPDATED, GET_VM, WAIT_TASK, ZONE_ACTION,
};

/// Version shared by every definition in the catalog.
pub const VERSION: &str = "8.0.0";

/// `provision` workflow
pub const PROVISION: &str = "provision";
/// `destroy` workflow
pub const DESTROY: &str = "destroy";
/// `start` workflow
pub const START: &str = "start";
/// `stop` workflow
pub const STOP: &str = "stop";
/// `reboot` workflow
pub const REBOOT: &str = "reboot";
/// `update` workflow
pub const UPDATE: &str = "update";
/// `add-nics` workflow
pub const ADD_NICS: &str = "add-nics";
/// `remove-nics` workflow
pub const REMOVE_NICS: &str = "remove-nics";
/// `snapshot` workflow
pub const SNAPSHOT: &str = "snapshot";
/// `rollback` workflow (snapshot rollback)
pub const ROLLBACK: &str = "rollback";
/// `delete-snapshot` workflow
pub const DELETE_SNAPSHOT: &str = "delete-snapshot";

const VM_TICKET: &[&str] = &[ACQUIRE_VM_TICKET, WAIT_VM_TICKET];

const FABRIC_NATS: &[&str] = &[
    ACQUIRE_FABRIC_NAT_TICKETS,
    WAIT_FABRIC_NAT_TICKETS,
    PROVISION_FABRIC_NATS,
    WAIT_FABRIC_NATS,
];

/// Register every task the catalog refers to.
pub fn registry() -> Result<TaskRegistry<Services>, DefinitionError> {
    let mut registry = TaskRegistry::new();
    crate::tickets::register(&mut registry)?;
    crate::zone_action::register(&mut registry)?;
    crate::nics::register(&mut registry)?;
    crate::fabric_nat::register(&mut registry)?;
    crate::migration::register(&mut registry)?;
    vm::register(&mut registry)?;
    nics::register(&mut registry)?;
    snapshot::register(&mut registry)?;
    Ok(registry)
}

/// Build the VM lifecycle definitions.
fn vm_workflows(
    registry: &TaskRegistry<Services>,
    services: &Services,
) -> Result<Vec<WorkflowDefinition<Services>>, DefinitionError> {
    let release = &[RELEASE_HELD_TICKETS];

    let mut defs = vec![
        registry
            .workflow(PROVISION, VERSION)
            .chain(&[vm::VALIDATE_PROVISION, vm::ALLOCATE_SERVER])
            .chain(VM_TICKET)
            .chain(&[PROVISION_NICS])
            .chain(FABRIC_NATS)
            .chain(&[
                vm::SETUP_PROVISION_REQUEST,
                ZONE_ACTION,
                WAIT_TASK,
                CHECK_STATE,
                CHECK_PROPAGATED,
            ])
            .chain(release)
            .onerror(&[REMOVE_ADDED_NICS, RELEASE_HELD_TICKETS])
            .build(services)?,
        registry
            .workflow(DESTROY, VERSION)
            .chain(&[GET_VM])
            .chain(VM_TICKET)
            .chain(&[
                vm::SETUP_DESTROY_REQUEST,
                ZONE_ACTION,
                WAIT_TASK,
                CHECK_STATE,
                DELETE_NICS,
                DESTROY_FABRIC_NATS,
            ])
            .chain(release)
            .onerror(release)
            .build(services)?,
        registry
            .workflow(ADD_NICS, VERSION)
            .chain(&[GET_VM])
            .chain(VM_TICKET)
            .chain(&[PROVISION_NICS])
            .chain(FABRIC_NATS)
            .chain(&[nics::SETUP_ADD_NICS_REQUEST, ZONE_ACTION, WAIT_TASK, CHECK_UPDATED])
            .chain(release)
            .onerror(&[REMOVE_ADDED_NICS, RELEASE_HELD_TICKETS])
            .build(services)?,
        registry
            .workflow(REMOVE_NICS, VERSION)
            .chain(&[GET_VM])
            .chain(VM_TICKET)
            .chain(&[
                nics::SETUP_REMOVE_NICS_REQUEST,
                ZONE_ACTION,
                WAIT_TASK,
                CHECK_UPDATED,
                DELETE_NICS,
                DESTROY_FABRIC_NATS,
            ])
            .chain(release)
            .onerror(release)
            .build(services)?,
    ];

    let ticketed = [
        (START, vm::SETUP_START_REQUEST, CHECK_STATE),
        (STOP, vm::SETUP_STOP_REQUEST, CHECK_STATE),
        (REBOOT, vm::SETUP_REBOOT_REQUEST, CHECK_UPDATED),
        (UPDATE, vm::SETUP_UPDATE_REQUEST, CHECK_UPDATED),
    ];
    for (name, setup, check) in ticketed {
        defs.push(
            registry
                .workflow(name, VERSION)
                .chain(&[GET_VM])
                .chain(VM_TICKET)
                .chain(&[setup, ZONE_ACTION, WAIT_TASK, check])
                .chain(release)
                .onerror(release)
                .build(services)?,
        );
    }

    let snapshots = [
        (SNAPSHOT, snapshot::SETUP_SNAPSHOT_REQUEST),
        (ROLLBACK, snapshot::SETUP_ROLLBACK_SNAPSHOT_REQUEST),
        (DELETE_SNAPSHOT, snapshot::SETUP_DELETE_SNAPSHOT_REQUEST),
    ];
    for (name, setup) in snapshots {
        defs.push(
            registry
                .workflow(name, VERSION)
                .chain(&[GET_VM, setup, ZONE_ACTION, WAIT_TASK, CHECK_UPDATED])
                .build(services)?,
        );
    }

    Ok(defs)
}

/// Every workflow definition, by name.
pub struct Catalog {
    definitions: BTreeMap<String, Arc<WorkflowDefinition<Services>>>,
}

impl Catalog {
    /// Register all tasks and build every definition against `services`.
    pub fn build(services: &Services) -> Result<Self, DefinitionError> {
        let registry = registry()?;
        let mut definitions = BTreeMap::new();

        for def in vm_workflows(&registry, services)? {
            definitions.insert(def.name().to_string(), Arc::new(def));
        }
        for action in MigrationAction::ALL {
            let def = migrate::define(&registry, services, action)?;
            definitions.insert(def.name().to_string(), Arc::new(def));
        }

        Ok(Self { definitions })
    }

    /// Definition named `name`.
    pub fn get(&self, name: &str) -> Option<Arc<WorkflowDefinition<Services>>> {
        self.definitions.get(name).cloned()
    }

    /// Workflow names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.definitions.keys().map(String::as_str).collect()
    }

    /// Definition running a migration `action`.
    pub fn migration(&self, action: MigrationAction) -> Option<Arc<WorkflowDefinition<Services>>> {
        self.get(&action.workflow_name())
    }

    /// A job for migration `action` on `vm_uuid`, with `extra` merged into
    /// its parameters.
    pub fn migration_job(
        &self,
        action: MigrationAction,
        vm_uuid: &str,
        extra: Map<String, Value>,
    ) -> Option<(Arc<WorkflowDefinition<Services>>, Job<Scratch>)> {
        let def = self.migration(action)?;
        let mut params = extra;
        params.insert(keys::VM_UUID.to_string(), Value::from(vm_uuid));
        params.insert(keys::MIGRATION_ACTION.to_string(), Value::from(action.as_str()));
        let job = def.new_job(params);
        Some((def, job))
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("workflows", &self.names())
            .finish()
    }
}
