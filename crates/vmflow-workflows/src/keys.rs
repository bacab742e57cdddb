// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job parameter names.
//!
//! Parameters are the only state that survives a task retry, so anything a
//! later task (or a recovery chain) depends on is written here.

// Request inputs

/// VM the job operates on
pub const VM_UUID: &str = "vm_uuid";
/// Server hosting the VM
pub const SERVER_UUID: &str = "server_uuid";
/// Owner account
pub const OWNER_UUID: &str = "owner_uuid";
/// Networks to attach: `[{uuid, ip?, primary?}]`
pub const NETWORKS: &str = "networks";
/// MACs of NICs to remove
pub const MACS: &str = "macs";
/// Fields to change on `update`
pub const UPDATE: &str = "update";
/// Snapshot name for snapshot workflows
pub const SNAPSHOT_NAME: &str = "snapshot_name";
/// Image to provision from
pub const IMAGE_UUID: &str = "image_uuid";
/// Package to provision with
pub const BILLING_ID: &str = "billing_id";
/// Memory in MiB
pub const RAM: &str = "ram";
/// Display alias
pub const ALIAS: &str = "alias";
/// Zone brand
pub const BRAND: &str = "brand";
/// Start the VM once provisioned (default true)
pub const AUTOBOOT: &str = "autoboot";

// Zone actions

/// Turn `zone_action` and `wait_task` into no-ops
pub const SKIP_ZONE_ACTION: &str = "skip_zone_action";
/// Agent task dispatched by `zone_action`
pub const ZONE_ACTION_TASK: &str = "zone_action_task";
/// Fingerprint of the request behind `zone_action_task`
pub const ZONE_ACTION_FINGERPRINT: &str = "zone_action_fingerprint";
/// Result of the last agent task `wait_task` saw complete
pub const ZONE_ACTION_RESULT: &str = "zone_action_result";
/// VM `last_modified` before the job changed anything
pub const LAST_MODIFIED: &str = "last_modified";
/// VM as first read by the job
pub const VM: &str = "vm";

// Tickets and networking

/// Tickets acquired by the job
pub const HELD_TICKETS: &str = "held_tickets";
/// NICs the VM ends up with after provisioning
pub const NICS: &str = "nics";
/// MACs of NICs this job created
pub const ADDED_NICS: &str = "added_nics";
/// NICs this job removed
pub const REMOVED_NICS: &str = "removed_nics";
/// Fabric NAT provisioning state
pub const FABRIC_NATS: &str = "fabric_nats";

// Migration

/// Requested migration action
pub const MIGRATION_ACTION: &str = "migration_action";
/// Migration started by automation rather than an operator
pub const MIGRATION_AUTOMATIC: &str = "migration_automatic";
/// Server to migrate to, bypassing placement
pub const OVERRIDE_SERVER_UUID: &str = "override_server_uuid";
/// Server chosen for the target VM
pub const TARGET_SERVER_UUID: &str = "target_server_uuid";
/// Identifier of the migration record this job works on
pub const MIGRATION_ID: &str = "migration_id";
/// Phase whose progress entry this job currently drives
pub const MIGRATION_PHASE: &str = "migration_phase";
/// Progress entry index per phase started by this job
pub const MIGRATION_PROGRESS: &str = "migration_progress";
/// IPs reserved by this job
pub const MIGRATION_RESERVED_IPS: &str = "migration_reserved_ips";
/// Whether the VM was running when the job first looked
pub const MIGRATION_VM_WAS_RUNNING: &str = "migration_vm_was_running";
/// Whether the target VM was running before a rollback stopped it
pub const MIGRATION_TARGET_WAS_RUNNING: &str = "migration_target_was_running";
/// The job passed its point of no return
pub const MIGRATION_DISALLOW_RETRY: &str = "migration_disallow_retry";
/// Agent task restarting the source during switch compensation
pub const MIGRATION_RESTART_TASK: &str = "migration_restart_task";
