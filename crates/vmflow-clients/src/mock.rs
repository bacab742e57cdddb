// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory fleet for testing.
//!
//! [`MockFleet`] implements every service interface over one shared state:
//! servers, VMs (keyed by server so a migration source and target can share
//! a uuid), agent tasks, waitlist tickets, networks, NICs, IP reservations and
//! migration records. Agent actions take effect when dispatched; the returned
//! task reports `active` for a configurable number of polls before it
//! finishes.
//!
//! Failures are injected per call (`fail_next`) or per agent action
//! (`fail_agent_action`) and are consumed once.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::allocator::AllocatorClient;
use crate::cnapi::CnapiClient;
use crate::error::{ClientError, Result};
use crate::jobs::JobsClient;
use crate::napi::NapiClient;
use crate::types::*;
use crate::vmapi::VmapiClient;

/// Snapshots left behind by migration syncs start with this prefix.
pub const SYNC_SNAPSHOT_PREFIX: &str = "vmadm-migration-sync";

/// An agent action recorded by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Target server
    pub server_uuid: String,
    /// Target VM
    pub vm_uuid: String,
    /// Action name (`migrate:<task>` for migration sub-tasks)
    pub action: String,
    /// Request payload
    pub payload: Value,
}

#[derive(Debug)]
struct MockTask {
    task: AgentTask,
    polls_left: u32,
}

#[derive(Debug, Default)]
struct FleetState {
    servers: Vec<String>,
    vms: BTreeMap<(String, String), Vm>,
    tasks: HashMap<String, MockTask>,
    tickets: Vec<Ticket>,
    networks: HashMap<String, Network>,
    nics: BTreeMap<String, Nic>,
    ips: HashMap<(String, String), IpEntry>,
    nic_tags: Vec<NicTag>,
    migrations: HashMap<String, Value>,
    progress_events: Vec<(String, MigrationProgressEvent)>,
    migrate_requests: Vec<(String, String)>,
    allocation_requests: Vec<AllocationRequest>,
    cancelled_jobs: Vec<String>,
    dispatches: Vec<Dispatch>,
    failures: HashMap<String, VecDeque<ClientError>>,
    agent_failures: HashMap<String, VecDeque<String>>,
    sync_endpoint: Option<AgentProcess>,
    provision_state: Option<VmState>,
    task_polls: u32,
    counter: u64,
    epoch: Option<DateTime<Utc>>,
}

impl FleetState {
    fn next_id(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Strictly increasing timestamps.
    fn tick(&mut self) -> DateTime<Utc> {
        let epoch = *self.epoch.get_or_insert_with(Utc::now);
        let n = self.next_id() as i64;
        epoch + TimeDelta::seconds(n)
    }

    fn take_failure(&mut self, op: &str) -> Result<()> {
        if let Some(queue) = self.failures.get_mut(op)
            && let Some(err) = queue.pop_front()
        {
            return Err(err);
        }
        Ok(())
    }

    fn take_agent_failure(&mut self, action: &str) -> Option<String> {
        self.agent_failures
            .get_mut(action)
            .and_then(VecDeque::pop_front)
    }

    fn new_task(&mut self, outcome: std::result::Result<Option<Value>, String>) -> AgentTaskHandle {
        let id = format!("task-{}", self.next_id());
        let (status, result, error) = match outcome {
            Ok(result) => (AgentTaskStatus::Complete, result, None),
            Err(message) => (AgentTaskStatus::Failure, None, Some(message)),
        };
        self.tasks.insert(
            id.clone(),
            MockTask {
                task: AgentTask {
                    id: id.clone(),
                    status,
                    progress: Some(100),
                    result,
                    error,
                },
                polls_left: self.task_polls,
            },
        );
        AgentTaskHandle { id }
    }

    fn inventoried(&self, vm_uuid: &str) -> Option<&Vm> {
        self.vms
            .values()
            .find(|vm| vm.uuid == vm_uuid && !vm.do_not_inventory)
    }

    fn not_found(service: &'static str, resource: impl Into<String>) -> ClientError {
        ClientError::NotFound {
            service,
            resource: resource.into(),
        }
    }

    fn promote_next(&mut self, scope: &str, id: &str) {
        let busy = self.tickets.iter().any(|t| {
            t.scope == scope && t.id == id && t.status == TicketStatus::Active
        });
        if busy {
            return;
        }
        if let Some(next) = self.tickets.iter_mut().find(|t| {
            t.scope == scope && t.id == id && t.status == TicketStatus::Queued
        }) {
            next.status = TicketStatus::Active;
        }
    }

    fn allocate_nic(&mut self, request: &CreateNic) -> Result<Nic> {
        let network = self
            .networks
            .get(&request.network_uuid)
            .cloned()
            .ok_or_else(|| Self::not_found("napi", format!("network {}", request.network_uuid)))?;

        let n = self.next_id();
        let mac = format!("90:b8:d0:{:02x}:{:02x}:{:02x}", (n >> 16) & 0xff, (n >> 8) & 0xff, n & 0xff);
        let ip = match &request.ip {
            Some(ip) => ip.clone(),
            None => format!("10.{}.{}.{}", (n >> 16) & 0xff, (n >> 8) & 0xff, (n & 0xff).max(2)),
        };

        let nic = Nic {
            mac: mac.clone(),
            ip: Some(ip.clone()),
            network_uuid: network.uuid.clone(),
            belongs_to_uuid: request.belongs_to_uuid.clone(),
            belongs_to_type: request.belongs_to_type.clone(),
            primary: request.primary,
            gateway: network.gateway.clone(),
            fabric: network.fabric,
            internet_nat: network.internet_nat,
        };
        self.nics.insert(mac, nic.clone());

        let entry = self
            .ips
            .entry((network.uuid.clone(), ip.clone()))
            .or_insert_with(|| IpEntry {
                ip: ip.clone(),
                network_uuid: network.uuid.clone(),
                reserved: false,
                free: true,
                belongs_to_uuid: None,
            });
        entry.free = false;
        entry.belongs_to_uuid = Some(request.belongs_to_uuid.clone());

        // A NIC at the gateway address means a NAT instance now serves the network
        if network.gateway.as_deref() == Some(ip.as_str())
            && let Some(net) = self.networks.get_mut(&network.uuid)
        {
            net.gateway_provisioned = true;
        }

        Ok(nic)
    }

    fn release_nic(&mut self, mac: &str) -> Option<Nic> {
        let nic = self.nics.remove(mac)?;
        if let Some(ip) = &nic.ip {
            if let Some(entry) = self.ips.get_mut(&(nic.network_uuid.clone(), ip.clone())) {
                entry.free = true;
                entry.belongs_to_uuid = None;
            }
            if let Some(net) = self.networks.get_mut(&nic.network_uuid)
                && net.gateway.as_deref() == Some(ip.as_str())
            {
                net.gateway_provisioned = false;
            }
        }
        Some(nic)
    }

    fn apply_action(
        &mut self,
        server_uuid: &str,
        vm_uuid: &str,
        action: &str,
        payload: &Value,
    ) -> std::result::Result<Option<Value>, String> {
        let now = self.tick();
        let sync_endpoint = self.sync_endpoint.clone();
        let key = (server_uuid.to_string(), vm_uuid.to_string());
        let Some(vm) = self.vms.get_mut(&key) else {
            return Err(format!("VM {} not found on {}", vm_uuid, server_uuid));
        };

        let str_field = |name: &str| payload.get(name).and_then(Value::as_str).map(str::to_string);

        match action {
            "start" | "reboot" => vm.state = VmState::Running,
            "stop" => vm.state = VmState::Stopped,
            "update" => {
                if let Some(alias) = str_field("alias") {
                    vm.alias = Some(alias);
                }
                if let Some(ram) = payload.get("ram").and_then(Value::as_u64) {
                    vm.ram = Some(ram);
                }
                if let Some(billing_id) = str_field("billing_id") {
                    vm.billing_id = Some(billing_id);
                }
                if let Some(quota) = payload.get("quota").and_then(Value::as_u64) {
                    vm.quota = Some(quota);
                }
            }
            "add_nics" => {
                let nics: Vec<Nic> = payload
                    .get("nics")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| format!("invalid nics: {}", e))?
                    .unwrap_or_default();
                for nic in nics {
                    if !vm.nics.iter().any(|n| n.mac == nic.mac) {
                        vm.nics.push(nic);
                    }
                }
            }
            "remove_nics" => {
                let macs: Vec<String> = payload
                    .get("macs")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default();
                vm.nics.retain(|n| !macs.contains(&n.mac));
            }
            "create_snapshot" => {
                let name = str_field("snapshot_name").ok_or("snapshot_name is required")?;
                if !vm.snapshots.iter().any(|s| s.name == name) {
                    vm.snapshots.push(Snapshot {
                        name,
                        created_at: Some(now),
                    });
                }
            }
            "rollback_snapshot" => {
                let name = str_field("snapshot_name").ok_or("snapshot_name is required")?;
                if !vm.snapshots.iter().any(|s| s.name == name) {
                    return Err(format!("snapshot {} does not exist", name));
                }
            }
            "delete_snapshot" => {
                let name = str_field("snapshot_name").ok_or("snapshot_name is required")?;
                vm.snapshots.retain(|s| s.name != name);
            }
            "migrate:receive" | "migrate:sync" => {
                let process = sync_endpoint.ok_or("no sync endpoint available")?;
                vm.last_modified = Some(now);
                if action == "migrate:sync" {
                    vm.snapshots.push(Snapshot {
                        name: format!("{}-{}", SYNC_SNAPSHOT_PREFIX, now.timestamp()),
                        created_at: Some(now),
                    });
                }
                return serde_json::to_value(process)
                    .map(Some)
                    .map_err(|e| e.to_string());
            }
            "migrate:kill_migration_process" | "migrate:setup" => {}
            "migrate:set_do_not_inventory" => {
                vm.do_not_inventory = payload.get("value").and_then(Value::as_bool).unwrap_or(true);
                if !vm.do_not_inventory {
                    vm.vm_migration_target = false;
                }
            }
            "migrate:restore_properties" => {
                if let Some(v) = payload.get("indestructible_zoneroot").and_then(Value::as_bool) {
                    vm.indestructible_zoneroot = v;
                }
                if let Some(v) = payload.get("indestructible_delegated").and_then(Value::as_bool) {
                    vm.indestructible_delegated = v;
                }
                if let Some(quota) = payload.get("quota").and_then(Value::as_u64) {
                    vm.quota = Some(quota);
                }
            }
            "migrate:remove_sync_snapshots" => {
                vm.snapshots
                    .retain(|s| !s.name.starts_with(SYNC_SNAPSHOT_PREFIX));
            }
            other => return Err(format!("unsupported action: {}", other)),
        }

        vm.last_modified = Some(now);
        Ok(None)
    }
}

fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Version a record gets when stored over `stored`.
///
/// Records carry the version they were read at (0 for a new record); a
/// mismatch means someone else wrote in between.
fn next_record_version(stored: Option<u64>, record: &Value) -> std::result::Result<u64, String> {
    let proposed = record.get("version").and_then(Value::as_u64).unwrap_or(0);
    let current = stored.unwrap_or(0);
    if proposed != current {
        return Err(format!(
            "stale migration record: version {} but stored version is {}",
            proposed, current
        ));
    }
    Ok(current + 1)
}

/// In-memory implementation of every service interface.
#[derive(Clone)]
pub struct MockFleet {
    state: Arc<Mutex<FleetState>>,
}

impl Default for MockFleet {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFleet {
    /// Create an empty fleet. Agent tasks report `active` once before
    /// finishing.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FleetState {
                task_polls: 1,
                ..Default::default()
            })),
        }
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    /// Add a server to the allocation pool.
    pub async fn add_server(&self, server_uuid: &str) {
        let mut state = self.state.lock().await;
        if !state.servers.iter().any(|s| s == server_uuid) {
            state.servers.push(server_uuid.to_string());
        }
    }

    /// Place a VM. Its NICs are registered with the network service.
    pub async fn add_vm(&self, mut vm: Vm) {
        let mut state = self.state.lock().await;
        if vm.last_modified.is_none() {
            vm.last_modified = Some(state.tick());
        }
        for nic in &vm.nics {
            state.nics.insert(nic.mac.clone(), nic.clone());
        }
        state
            .vms
            .insert((vm.server_uuid.clone(), vm.uuid.clone()), vm);
    }

    /// Add a network.
    pub async fn add_network(&self, network: Network) {
        let mut state = self.state.lock().await;
        state.networks.insert(network.uuid.clone(), network);
    }

    /// Register a NIC directly with the network service.
    pub async fn add_nic(&self, nic: Nic) {
        let mut state = self.state.lock().await;
        state.nics.insert(nic.mac.clone(), nic);
    }

    /// Add a NIC tag.
    pub async fn add_nic_tag(&self, tag: NicTag) {
        self.state.lock().await.nic_tags.push(tag);
    }

    /// Endpoint returned by the `receive` and `sync` migration sub-tasks.
    pub async fn set_sync_endpoint(&self, process: AgentProcess) {
        self.state.lock().await.sync_endpoint = Some(process);
    }

    /// How many polls an agent task reports `active` before finishing.
    pub async fn set_task_polls(&self, polls: u32) {
        self.state.lock().await.task_polls = polls;
    }

    /// State given to VMs provisioned through the inventory service.
    pub async fn set_provision_state(&self, state: VmState) {
        self.state.lock().await.provision_state = Some(state);
    }

    /// Force a VM's state.
    pub async fn set_vm_state(&self, server_uuid: &str, vm_uuid: &str, vm_state: VmState) {
        let mut state = self.state.lock().await;
        let now = state.tick();
        if let Some(vm) = state
            .vms
            .get_mut(&(server_uuid.to_string(), vm_uuid.to_string()))
        {
            vm.state = vm_state;
            vm.last_modified = Some(now);
        }
    }

    /// Store a migration record as-is.
    pub async fn put_migration(&self, vm_uuid: &str, record: Value) {
        self.state
            .lock()
            .await
            .migrations
            .insert(vm_uuid.to_string(), record);
    }

    // ------------------------------------------------------------------
    // Failure injection
    // ------------------------------------------------------------------

    /// Fail the next call of `op` (e.g. `"cnapi.create_ticket"`) with `err`.
    pub async fn fail_next(&self, op: &str, err: ClientError) {
        self.state
            .lock()
            .await
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(err);
    }

    /// Make the next agent task for `action` finish with `failure`.
    ///
    /// Migration sub-tasks are named `migrate:<task>`.
    pub async fn fail_agent_action(&self, action: &str, message: &str) {
        self.state
            .lock()
            .await
            .agent_failures
            .entry(action.to_string())
            .or_default()
            .push_back(message.to_string());
    }

    /// Expire a ticket as the ticket service would after `expires_at`.
    pub async fn expire_ticket(&self, ticket_uuid: &str) {
        let mut state = self.state.lock().await;
        let mut key = None;
        if let Some(ticket) = state.tickets.iter_mut().find(|t| t.uuid == ticket_uuid) {
            ticket.status = TicketStatus::Expired;
            key = Some((ticket.scope.clone(), ticket.id.clone()));
        }
        if let Some((scope, id)) = key {
            state.promote_next(&scope, &id);
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// The VM with `vm_uuid` on `server_uuid`, hidden or not.
    pub async fn vm_on(&self, server_uuid: &str, vm_uuid: &str) -> Option<Vm> {
        self.state
            .lock()
            .await
            .vms
            .get(&(server_uuid.to_string(), vm_uuid.to_string()))
            .cloned()
    }

    /// Every copy of `vm_uuid` across servers.
    pub async fn vm_copies(&self, vm_uuid: &str) -> Vec<Vm> {
        self.state
            .lock()
            .await
            .vms
            .values()
            .filter(|vm| vm.uuid == vm_uuid)
            .cloned()
            .collect()
    }

    /// All tickets ever created, in creation order.
    pub async fn tickets(&self) -> Vec<Ticket> {
        self.state.lock().await.tickets.clone()
    }

    /// Tickets still queued or active.
    pub async fn held_tickets(&self) -> Vec<Ticket> {
        self.state
            .lock()
            .await
            .tickets
            .iter()
            .filter(|t| matches!(t.status, TicketStatus::Queued | TicketStatus::Active))
            .cloned()
            .collect()
    }

    /// Agent actions dispatched so far.
    pub async fn dispatches(&self) -> Vec<Dispatch> {
        self.state.lock().await.dispatches.clone()
    }

    /// Number of dispatches of `action`.
    pub async fn dispatch_count(&self, action: &str) -> usize {
        self.state
            .lock()
            .await
            .dispatches
            .iter()
            .filter(|d| d.action == action)
            .count()
    }

    /// NICs on a network.
    pub async fn nics_on_network(&self, network_uuid: &str) -> Vec<Nic> {
        self.state
            .lock()
            .await
            .nics
            .values()
            .filter(|n| n.network_uuid == network_uuid)
            .cloned()
            .collect()
    }

    /// NICs owned by an object.
    pub async fn nics_of(&self, belongs_to_uuid: &str) -> Vec<Nic> {
        self.state
            .lock()
            .await
            .nics
            .values()
            .filter(|n| n.belongs_to_uuid == belongs_to_uuid)
            .cloned()
            .collect()
    }

    /// A network.
    pub async fn network(&self, network_uuid: &str) -> Option<Network> {
        self.state.lock().await.networks.get(network_uuid).cloned()
    }

    /// Reserved IPs as `(network, ip)` pairs, sorted.
    pub async fn reserved_ips(&self) -> Vec<(String, String)> {
        let mut reserved: Vec<_> = self
            .state
            .lock()
            .await
            .ips
            .values()
            .filter(|e| e.reserved)
            .map(|e| (e.network_uuid.clone(), e.ip.clone()))
            .collect();
        reserved.sort();
        reserved
    }

    /// Stored migration record.
    pub async fn migration(&self, vm_uuid: &str) -> Option<Value> {
        self.state.lock().await.migrations.get(vm_uuid).cloned()
    }

    /// Progress events posted so far.
    pub async fn progress_events(&self) -> Vec<(String, MigrationProgressEvent)> {
        self.state.lock().await.progress_events.clone()
    }

    /// Jobs cancelled through the job service.
    pub async fn cancelled_jobs(&self) -> Vec<String> {
        self.state.lock().await.cancelled_jobs.clone()
    }

    /// `(vm, action)` pairs passed to `migrate`.
    pub async fn migrate_requests(&self) -> Vec<(String, String)> {
        self.state.lock().await.migrate_requests.clone()
    }

    /// Requests passed to `allocate`, in order.
    pub async fn allocation_requests(&self) -> Vec<AllocationRequest> {
        self.state.lock().await.allocation_requests.clone()
    }
}

#[async_trait]
impl CnapiClient for MockFleet {
    async fn vm_action(
        &self,
        server_uuid: &str,
        vm_uuid: &str,
        action: &str,
        payload: &Value,
    ) -> Result<AgentTaskHandle> {
        let mut state = self.state.lock().await;
        state.take_failure("cnapi.vm_action")?;

        let key = if action == "migrate" {
            format!(
                "migrate:{}",
                payload
                    .get("migration_task")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
            )
        } else {
            action.to_string()
        };
        state.dispatches.push(Dispatch {
            server_uuid: server_uuid.to_string(),
            vm_uuid: vm_uuid.to_string(),
            action: key.clone(),
            payload: payload.clone(),
        });

        if !state
            .vms
            .contains_key(&(server_uuid.to_string(), vm_uuid.to_string()))
        {
            return Err(FleetState::not_found(
                "cnapi",
                format!("/servers/{}/vms/{}", server_uuid, vm_uuid),
            ));
        }

        if let Some(message) = state.take_agent_failure(&key) {
            return Ok(state.new_task(Err(message)));
        }
        let outcome = state.apply_action(server_uuid, vm_uuid, &key, payload);
        Ok(state.new_task(outcome))
    }

    async fn create_vm(&self, server_uuid: &str, payload: &Value) -> Result<AgentTaskHandle> {
        let mut state = self.state.lock().await;
        state.take_failure("cnapi.create_vm")?;

        let mut vm: Vm = {
            let mut doc = payload.clone();
            if let Some(obj) = doc.as_object_mut() {
                obj.insert("server_uuid".to_string(), json!(server_uuid));
                obj.entry("state").or_insert(json!("provisioning"));
            }
            serde_json::from_value(doc).map_err(|e| ClientError::Http {
                service: "cnapi",
                status: 422,
                body: format!("invalid VM payload: {}", e),
            })?
        };

        state.dispatches.push(Dispatch {
            server_uuid: server_uuid.to_string(),
            vm_uuid: vm.uuid.clone(),
            action: "provision".to_string(),
            payload: payload.clone(),
        });

        if let Some(message) = state.take_agent_failure("provision") {
            return Ok(state.new_task(Err(message)));
        }

        let key = (server_uuid.to_string(), vm.uuid.clone());
        if state.vms.contains_key(&key) {
            return Ok(state.new_task(Err(format!("VM {} already exists", vm.uuid))));
        }

        // Inventory payloads leave `autoboot` out; the agent defaults it on
        if payload.get("autoboot").is_none() {
            vm.autoboot = true;
        }
        vm.state = if vm.autoboot {
            VmState::Running
        } else {
            VmState::Stopped
        };
        vm.last_modified = Some(state.tick());
        for nic in &vm.nics {
            state.nics.insert(nic.mac.clone(), nic.clone());
        }
        state.vms.insert(key, vm);
        Ok(state.new_task(Ok(None)))
    }

    async fn destroy_vm(&self, server_uuid: &str, vm_uuid: &str) -> Result<AgentTaskHandle> {
        let mut state = self.state.lock().await;
        state.take_failure("cnapi.destroy_vm")?;

        state.dispatches.push(Dispatch {
            server_uuid: server_uuid.to_string(),
            vm_uuid: vm_uuid.to_string(),
            action: "destroy".to_string(),
            payload: Value::Null,
        });

        let key = (server_uuid.to_string(), vm_uuid.to_string());
        if !state.vms.contains_key(&key) {
            return Err(FleetState::not_found(
                "cnapi",
                format!("/servers/{}/vms/{}", server_uuid, vm_uuid),
            ));
        }
        if let Some(message) = state.take_agent_failure("destroy") {
            return Ok(state.new_task(Err(message)));
        }
        state.vms.remove(&key);
        Ok(state.new_task(Ok(None)))
    }

    async fn load_vm(&self, server_uuid: &str, vm_uuid: &str) -> Result<Vm> {
        let mut state = self.state.lock().await;
        state.take_failure("cnapi.load_vm")?;
        state
            .vms
            .get(&(server_uuid.to_string(), vm_uuid.to_string()))
            .cloned()
            .ok_or_else(|| {
                FleetState::not_found("cnapi", format!("/servers/{}/vms/{}", server_uuid, vm_uuid))
            })
    }

    async fn get_task(&self, task_id: &str) -> Result<AgentTask> {
        let mut state = self.state.lock().await;
        state.take_failure("cnapi.get_task")?;
        let entry = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| FleetState::not_found("cnapi", format!("/tasks/{}", task_id)))?;

        if entry.polls_left > 0 {
            entry.polls_left -= 1;
            return Ok(AgentTask {
                id: entry.task.id.clone(),
                status: AgentTaskStatus::Active,
                progress: Some(50),
                result: None,
                error: None,
            });
        }
        Ok(entry.task.clone())
    }

    async fn create_ticket(&self, server_uuid: &str, request: &CreateTicket) -> Result<Ticket> {
        let mut state = self.state.lock().await;
        state.take_failure("cnapi.create_ticket")?;

        let contended = state.tickets.iter().any(|t| {
            t.scope == request.scope
                && t.id == request.id
                && matches!(t.status, TicketStatus::Queued | TicketStatus::Active)
        });
        let ticket = Ticket {
            uuid: new_uuid(),
            server_uuid: server_uuid.to_string(),
            scope: request.scope.clone(),
            id: request.id.clone(),
            status: if contended {
                TicketStatus::Queued
            } else {
                TicketStatus::Active
            },
            expires_at: request.expires_at,
        };
        state.tickets.push(ticket.clone());
        Ok(ticket)
    }

    async fn get_ticket(&self, ticket_uuid: &str) -> Result<Ticket> {
        let mut state = self.state.lock().await;
        state.take_failure("cnapi.get_ticket")?;
        state
            .tickets
            .iter()
            .find(|t| t.uuid == ticket_uuid)
            .cloned()
            .ok_or_else(|| FleetState::not_found("cnapi", format!("/tickets/{}", ticket_uuid)))
    }

    async fn wait_ticket(&self, ticket_uuid: &str) -> Result<Ticket> {
        let mut state = self.state.lock().await;
        state.take_failure("cnapi.wait_ticket")?;
        state
            .tickets
            .iter()
            .find(|t| t.uuid == ticket_uuid)
            .cloned()
            .ok_or_else(|| FleetState::not_found("cnapi", format!("/tickets/{}", ticket_uuid)))
    }

    async fn release_ticket(&self, ticket_uuid: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.take_failure("cnapi.release_ticket")?;

        let ticket = state
            .tickets
            .iter_mut()
            .find(|t| {
                t.uuid == ticket_uuid
                    && matches!(t.status, TicketStatus::Queued | TicketStatus::Active)
            })
            .ok_or_else(|| FleetState::not_found("cnapi", format!("/tickets/{}", ticket_uuid)))?;
        ticket.status = TicketStatus::Released;
        let (scope, id) = (ticket.scope.clone(), ticket.id.clone());
        state.promote_next(&scope, &id);
        Ok(())
    }
}

#[async_trait]
impl VmapiClient for MockFleet {
    async fn get_vm(&self, vm_uuid: &str, include_dni: bool) -> Result<Vm> {
        let mut state = self.state.lock().await;
        state.take_failure("vmapi.get_vm")?;
        if let Some(vm) = state.inventoried(vm_uuid) {
            return Ok(vm.clone());
        }
        if include_dni
            && let Some(vm) = state.vms.values().find(|vm| vm.uuid == vm_uuid)
        {
            return Ok(vm.clone());
        }
        Err(FleetState::not_found("vmapi", format!("/vms/{}", vm_uuid)))
    }

    async fn list_vms(&self, filter: &VmFilter) -> Result<Vec<Vm>> {
        let mut state = self.state.lock().await;
        state.take_failure("vmapi.list_vms")?;
        Ok(state
            .vms
            .values()
            .filter(|vm| !vm.do_not_inventory)
            .filter(|vm| filter.uuid.as_ref().is_none_or(|u| *u == vm.uuid))
            .filter(|vm| {
                filter
                    .owner_uuid
                    .as_ref()
                    .is_none_or(|o| vm.owner_uuid.as_ref() == Some(o))
            })
            .filter(|vm| filter.server_uuid.as_ref().is_none_or(|s| *s == vm.server_uuid))
            .filter(|vm| filter.state.is_none_or(|s| s == vm.state))
            .cloned()
            .collect())
    }

    async fn create_vm(&self, payload: &Value) -> Result<CreateVmResponse> {
        let mut state = self.state.lock().await;
        state.take_failure("vmapi.create_vm")?;

        let vm_uuid = match payload.get("uuid").and_then(Value::as_str) {
            Some(uuid) => uuid.to_string(),
            None => new_uuid(),
        };
        if state.inventoried(&vm_uuid).is_some() {
            return Err(ClientError::Conflict {
                service: "vmapi",
                message: format!("VM {} already exists", vm_uuid),
            });
        }

        let server_uuid = match payload.get("server_uuid").and_then(Value::as_str) {
            Some(server) => server.to_string(),
            None => state.servers.first().cloned().ok_or(ClientError::Http {
                service: "vmapi",
                status: 409,
                body: "no servers available".to_string(),
            })?,
        };

        let mut vm = Vm::new(&vm_uuid, &server_uuid, state.provision_state.unwrap_or(VmState::Running));
        vm.owner_uuid = payload.get("owner_uuid").and_then(Value::as_str).map(str::to_string);
        vm.image_uuid = payload.get("image_uuid").and_then(Value::as_str).map(str::to_string);
        vm.billing_id = payload.get("billing_id").and_then(Value::as_str).map(str::to_string);
        vm.alias = payload.get("alias").and_then(Value::as_str).map(str::to_string);
        if let Some(tags) = payload.get("tags").and_then(Value::as_object) {
            vm.tags = tags.clone();
        }

        let networks = payload
            .get("networks")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for network in networks {
            let Some(network_uuid) = network
                .get("uuid")
                .or_else(|| network.get("ipv4_uuid"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            let nic = state.allocate_nic(&CreateNic {
                network_uuid: network_uuid.to_string(),
                belongs_to_uuid: vm_uuid.clone(),
                belongs_to_type: "zone".to_string(),
                owner_uuid: vm.owner_uuid.clone(),
                ip: network
                    .get("ip")
                    .or_else(|| network.get("ipv4_ips").and_then(|ips| ips.get(0)))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                primary: network.get("primary").and_then(Value::as_bool).unwrap_or(false),
            })?;
            vm.nics.push(nic);
        }

        vm.last_modified = Some(state.tick());
        state.vms.insert((server_uuid, vm_uuid.clone()), vm);

        let job_uuid = new_uuid();
        Ok(CreateVmResponse { vm_uuid, job_uuid })
    }

    async fn delete_vm(&self, vm_uuid: &str) -> Result<JobResponse> {
        let mut state = self.state.lock().await;
        state.take_failure("vmapi.delete_vm")?;

        let key = state
            .vms
            .iter()
            .find(|(_, vm)| vm.uuid == vm_uuid && !vm.do_not_inventory)
            .map(|(key, _)| key.clone())
            .ok_or_else(|| FleetState::not_found("vmapi", format!("/vms/{}", vm_uuid)))?;
        state.vms.remove(&key);

        let macs: Vec<String> = state
            .nics
            .values()
            .filter(|n| n.belongs_to_uuid == vm_uuid)
            .map(|n| n.mac.clone())
            .collect();
        for mac in macs {
            state.release_nic(&mac);
        }

        let job_uuid = new_uuid();
        Ok(JobResponse { job_uuid })
    }

    async fn store_migration(&self, vm_uuid: &str, record: &Value) -> Result<u64> {
        let mut state = self.state.lock().await;
        state.take_failure("vmapi.store_migration")?;

        let stored = state
            .migrations
            .get(vm_uuid)
            .and_then(|r| r.get("version"))
            .and_then(Value::as_u64);
        let version = next_record_version(stored, record).map_err(|message| ClientError::Conflict {
            service: "vmapi",
            message,
        })?;

        let mut stored = record.clone();
        if let Some(obj) = stored.as_object_mut() {
            obj.insert("version".to_string(), json!(version));
        }
        state.migrations.insert(vm_uuid.to_string(), stored);
        Ok(version)
    }

    async fn post_migration_progress(
        &self,
        vm_uuid: &str,
        event: &MigrationProgressEvent,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.take_failure("vmapi.post_migration_progress")?;
        state
            .progress_events
            .push((vm_uuid.to_string(), event.clone()));
        Ok(())
    }

    async fn get_migration(&self, vm_uuid: &str) -> Result<Value> {
        let mut state = self.state.lock().await;
        state.take_failure("vmapi.get_migration")?;
        state
            .migrations
            .get(vm_uuid)
            .cloned()
            .ok_or_else(|| FleetState::not_found("vmapi", format!("/migrations/{}", vm_uuid)))
    }

    async fn migrate(&self, vm_uuid: &str, action: &str) -> Result<JobResponse> {
        let mut state = self.state.lock().await;
        state.take_failure("vmapi.migrate")?;
        state
            .migrate_requests
            .push((vm_uuid.to_string(), action.to_string()));
        let job_uuid = new_uuid();
        Ok(JobResponse { job_uuid })
    }
}

#[async_trait]
impl NapiClient for MockFleet {
    async fn list_nics(&self, filter: &NicFilter) -> Result<Vec<Nic>> {
        let mut state = self.state.lock().await;
        state.take_failure("napi.list_nics")?;
        Ok(state
            .nics
            .values()
            .filter(|n| {
                filter
                    .belongs_to_uuid
                    .as_ref()
                    .is_none_or(|b| *b == n.belongs_to_uuid)
            })
            .filter(|n| filter.network_uuid.as_ref().is_none_or(|u| *u == n.network_uuid))
            .cloned()
            .collect())
    }

    async fn create_nic(&self, request: &CreateNic) -> Result<Nic> {
        let mut state = self.state.lock().await;
        state.take_failure("napi.create_nic")?;
        state.allocate_nic(request)
    }

    async fn delete_nic(&self, mac: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.take_failure("napi.delete_nic")?;
        state
            .release_nic(mac)
            .map(|_| ())
            .ok_or_else(|| FleetState::not_found("napi", format!("/nics/{}", mac)))
    }

    async fn get_network(&self, network_uuid: &str) -> Result<Network> {
        let mut state = self.state.lock().await;
        state.take_failure("napi.get_network")?;
        state
            .networks
            .get(network_uuid)
            .cloned()
            .ok_or_else(|| FleetState::not_found("napi", format!("/networks/{}", network_uuid)))
    }

    async fn get_ip(&self, network_uuid: &str, ip: &str) -> Result<IpEntry> {
        let mut state = self.state.lock().await;
        state.take_failure("napi.get_ip")?;
        if !state.networks.contains_key(network_uuid) {
            return Err(FleetState::not_found(
                "napi",
                format!("/networks/{}", network_uuid),
            ));
        }
        Ok(state
            .ips
            .get(&(network_uuid.to_string(), ip.to_string()))
            .cloned()
            .unwrap_or_else(|| IpEntry {
                ip: ip.to_string(),
                network_uuid: network_uuid.to_string(),
                reserved: false,
                free: true,
                belongs_to_uuid: None,
            }))
    }

    async fn set_ip_reserved(
        &self,
        network_uuid: &str,
        ip: &str,
        reserved: bool,
    ) -> Result<IpEntry> {
        let mut state = self.state.lock().await;
        state.take_failure("napi.set_ip_reserved")?;
        if !state.networks.contains_key(network_uuid) {
            return Err(FleetState::not_found(
                "napi",
                format!("/networks/{}", network_uuid),
            ));
        }
        let entry = state
            .ips
            .entry((network_uuid.to_string(), ip.to_string()))
            .or_insert_with(|| IpEntry {
                ip: ip.to_string(),
                network_uuid: network_uuid.to_string(),
                reserved: false,
                free: true,
                belongs_to_uuid: None,
            });
        entry.reserved = reserved;
        Ok(entry.clone())
    }

    async fn list_nic_tags(&self) -> Result<Vec<NicTag>> {
        let mut state = self.state.lock().await;
        state.take_failure("napi.list_nic_tags")?;
        Ok(state.nic_tags.clone())
    }
}

#[async_trait]
impl AllocatorClient for MockFleet {
    async fn allocate(&self, request: &AllocationRequest) -> Result<Allocation> {
        let mut state = self.state.lock().await;
        state.take_failure("allocator.allocate")?;
        state.allocation_requests.push(request.clone());
        state
            .servers
            .iter()
            .find(|s| !request.exclude_servers.contains(s))
            .map(|s| Allocation {
                server_uuid: s.clone(),
            })
            .ok_or_else(|| ClientError::Http {
                service: "allocator",
                status: 422,
                body: "no allocatable servers".to_string(),
            })
    }
}

#[async_trait]
impl JobsClient for MockFleet {
    async fn cancel_job(&self, job_uuid: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.take_failure("jobs.cancel_job")?;
        state.cancelled_jobs.push(job_uuid.to_string());
        Ok(())
    }
}
