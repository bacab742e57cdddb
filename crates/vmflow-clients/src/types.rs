// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire types shared by the service interfaces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// VMs
// ============================================================================

/// VM lifecycle state as reported by the compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// Being created
    Provisioning,
    /// Running
    Running,
    /// Transitioning to stopped
    Stopping,
    /// Stopped
    Stopped,
    /// Provisioning failed
    Failed,
    /// Destroyed
    Destroyed,
    /// Any state this crate does not model
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmState::Provisioning => "provisioning",
            VmState::Running => "running",
            VmState::Stopping => "stopping",
            VmState::Stopped => "stopped",
            VmState::Failed => "failed",
            VmState::Destroyed => "destroyed",
            VmState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A virtual machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    /// VM uuid
    pub uuid: String,
    /// Server the VM lives on
    pub server_uuid: String,
    /// Current state
    pub state: VmState,
    /// Owner account
    #[serde(default)]
    pub owner_uuid: Option<String>,
    /// Zone brand
    #[serde(default)]
    pub brand: Option<String>,
    /// Image the VM was created from
    #[serde(default)]
    pub image_uuid: Option<String>,
    /// Package
    #[serde(default)]
    pub billing_id: Option<String>,
    /// Memory in MiB
    #[serde(default)]
    pub ram: Option<u64>,
    /// Display alias
    #[serde(default)]
    pub alias: Option<String>,
    /// Network interfaces
    #[serde(default)]
    pub nics: Vec<Nic>,
    /// Hidden from inventory listings
    #[serde(default)]
    pub do_not_inventory: bool,
    /// Reserved as the target of a migration
    #[serde(default)]
    pub vm_migration_target: bool,
    /// Start on boot
    #[serde(default)]
    pub autoboot: bool,
    /// Last modification time
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    /// Snapshots
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    /// Zone root cannot be destroyed
    #[serde(default)]
    pub indestructible_zoneroot: bool,
    /// Delegated dataset cannot be destroyed
    #[serde(default)]
    pub indestructible_delegated: bool,
    /// Dataset quota in GiB
    #[serde(default)]
    pub quota: Option<u64>,
    /// Free-form tags
    #[serde(default)]
    pub tags: Map<String, Value>,
}

impl Vm {
    /// Create a VM record with only identity and state set.
    pub fn new(uuid: impl Into<String>, server_uuid: impl Into<String>, state: VmState) -> Self {
        Self {
            uuid: uuid.into(),
            server_uuid: server_uuid.into(),
            state,
            owner_uuid: None,
            brand: None,
            image_uuid: None,
            billing_id: None,
            ram: None,
            alias: None,
            nics: Vec::new(),
            do_not_inventory: false,
            vm_migration_target: false,
            autoboot: true,
            last_modified: None,
            snapshots: Vec::new(),
            indestructible_zoneroot: false,
            indestructible_delegated: false,
            quota: None,
            tags: Map::new(),
        }
    }
}

/// A VM snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot name
    pub name: String,
    /// Creation time
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Filter for inventory listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VmFilter {
    /// Exact uuid
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Owner account
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_uuid: Option<String>,
    /// Server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_uuid: Option<String>,
    /// State
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<VmState>,
}

/// Response to an inventory-driven provision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVmResponse {
    /// uuid of the new VM
    pub vm_uuid: String,
    /// Job provisioning it
    pub job_uuid: String,
}

/// A job started by the inventory service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResponse {
    /// Job uuid
    pub job_uuid: String,
}

// ============================================================================
// Agent tasks
// ============================================================================

/// Handle to an asynchronous compute-node agent task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTaskHandle {
    /// Task id
    #[serde(alias = "task_id")]
    pub id: String,
}

/// Agent task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentTaskStatus {
    /// Waiting for the agent
    Queued,
    /// Running
    Active,
    /// Finished successfully
    Complete,
    /// Finished with an error
    Failure,
}

impl AgentTaskStatus {
    /// Whether the task has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentTaskStatus::Complete | AgentTaskStatus::Failure)
    }
}

/// State of an agent task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    /// Task id
    pub id: String,
    /// Status
    pub status: AgentTaskStatus,
    /// Progress percentage
    #[serde(default)]
    pub progress: Option<u32>,
    /// Task output
    #[serde(default)]
    pub result: Option<Value>,
    /// Failure message
    #[serde(default)]
    pub error: Option<String>,
}

/// A process started by the agent (migration sync endpoints).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProcess {
    /// Process id on the compute node
    pub pid: u32,
    /// Address the process listens on
    pub host: String,
    /// Port the process listens on
    pub port: u16,
}

// ============================================================================
// Tickets
// ============================================================================

/// Waitlist ticket status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    /// Waiting behind another holder
    Queued,
    /// Held
    Active,
    /// Released by its holder
    Released,
    /// Expired before release
    Expired,
}

/// A waitlist ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket uuid
    pub uuid: String,
    /// Server the waitlist belongs to
    pub server_uuid: String,
    /// Resource kind (`vm`, `fabric_nat`, `allocate`)
    pub scope: String,
    /// Resource identifier
    pub id: String,
    /// Status
    pub status: TicketStatus,
    /// Expiry
    pub expires_at: DateTime<Utc>,
}

/// Request body for creating a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTicket {
    /// Resource kind
    pub scope: String,
    /// Resource identifier
    pub id: String,
    /// Expiry
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Networking
// ============================================================================

/// A network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nic {
    /// MAC address (NIC identifier)
    pub mac: String,
    /// Assigned IP
    #[serde(default)]
    pub ip: Option<String>,
    /// Network the NIC is on
    pub network_uuid: String,
    /// Owning object
    pub belongs_to_uuid: String,
    /// Owning object type (`zone`, `server`, `other`)
    #[serde(default = "default_belongs_to_type")]
    pub belongs_to_type: String,
    /// Primary NIC of its owner
    #[serde(default)]
    pub primary: bool,
    /// Gateway for this NIC's network
    #[serde(default)]
    pub gateway: Option<String>,
    /// Network is a fabric (overlay) network
    #[serde(default)]
    pub fabric: bool,
    /// Network needs outbound NAT
    #[serde(default)]
    pub internet_nat: bool,
}

fn default_belongs_to_type() -> String {
    "zone".to_string()
}

/// Filter for NIC listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NicFilter {
    /// Owning object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub belongs_to_uuid: Option<String>,
    /// Network
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_uuid: Option<String>,
}

/// Request body for creating a NIC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateNic {
    /// Network
    pub network_uuid: String,
    /// Owning object
    pub belongs_to_uuid: String,
    /// Owning object type
    pub belongs_to_type: String,
    /// Owner account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_uuid: Option<String>,
    /// Requested IP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Primary NIC
    #[serde(default)]
    pub primary: bool,
}

/// A network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Network uuid
    pub uuid: String,
    /// Name
    #[serde(default)]
    pub name: String,
    /// NIC tag
    #[serde(default)]
    pub nic_tag: Option<String>,
    /// Gateway address
    #[serde(default)]
    pub gateway: Option<String>,
    /// A NAT gateway instance already serves this network
    #[serde(default)]
    pub gateway_provisioned: bool,
    /// Fabric (overlay) network
    #[serde(default)]
    pub fabric: bool,
    /// Needs outbound NAT
    #[serde(default)]
    pub internet_nat: bool,
    /// VLAN
    #[serde(default)]
    pub vlan_id: Option<u16>,
}

/// An IP address record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpEntry {
    /// Address
    pub ip: String,
    /// Network
    pub network_uuid: String,
    /// Reserved (not handed out automatically)
    #[serde(default)]
    pub reserved: bool,
    /// Not assigned to anything
    #[serde(default)]
    pub free: bool,
    /// Current owner
    #[serde(default)]
    pub belongs_to_uuid: Option<String>,
}

/// A NIC tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicTag {
    /// Tag name
    pub name: String,
    /// Tag uuid
    #[serde(default)]
    pub uuid: Option<String>,
    /// MTU
    #[serde(default)]
    pub mtu: Option<u32>,
}

// ============================================================================
// Allocation
// ============================================================================

/// Placement request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    /// VM being placed
    pub vm_uuid: String,
    /// Owner account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_uuid: Option<String>,
    /// Image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_uuid: Option<String>,
    /// Package
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_id: Option<String>,
    /// Memory in MiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram: Option<u64>,
    /// NIC tags the server must provide
    #[serde(default)]
    pub nic_tags: Vec<String>,
    /// Servers that must not be chosen
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_servers: Vec<String>,
}

/// Placement decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Chosen server
    pub server_uuid: String,
}

// ============================================================================
// Migration
// ============================================================================

/// Progress notification posted to the inventory service while a migration
/// action runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationProgressEvent {
    /// Migration phase
    pub phase: String,
    /// Entry state
    pub state: String,
    /// Human readable message
    #[serde(default)]
    pub message: String,
    /// Bytes transferred so far
    #[serde(default)]
    pub current_progress: u64,
    /// Total bytes to transfer
    #[serde(default)]
    pub total_progress: u64,
    /// Job driving the action
    #[serde(default)]
    pub job_uuid: Option<String>,
}
