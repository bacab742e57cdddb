// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! On-demand NAT gateways for fabric networks.
//!
//! A fabric network with `internet_nat` needs a NAT instance at its gateway
//! address. Provisioning is serialized per network by a `fabric_nat` ticket:
//!
//! 1. acquire one ticket per distinct network among the job's NICs
//! 2. wait for the tickets
//! 3. re-read each network; if a racing job already provisioned the gateway,
//!    release the ticket and move on, otherwise create the NAT instance
//! 4. wait for each NAT instance to run, releasing its ticket
//!
//! Destroying a VM runs the mirror image: once the last tenant NIC leaves a
//! network, the NAT instance is deleted under the same ticket. Tenants are
//! counted again once the ticket is held, since a provision queued ahead of
//! us may have added one.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};
use vmflow_clients::{Nic, NicFilter, VmState};
use vmflow_core::{
    BoxFuture, DefinitionError, Job, TaskDescriptor, TaskError, TaskOutcome, TaskRegistry,
    TaskResult,
};

use crate::keys;
use crate::scratch::Scratch;
use crate::services::{Services, capability};
use crate::tickets::{self, DEFAULT_TICKET_SERVER, FABRIC_NAT_SCOPE};

/// Task acquiring a ticket per fabric network needing NAT.
pub const ACQUIRE_FABRIC_NAT_TICKETS: &str = "acquire_fabric_nat_tickets";
/// Task waiting for the fabric NAT tickets.
pub const WAIT_FABRIC_NAT_TICKETS: &str = "wait_fabric_nat_tickets";
/// Task creating missing NAT instances.
pub const PROVISION_FABRIC_NATS: &str = "provision_fabric_nats";
/// Task waiting for NAT instances to run.
pub const WAIT_FABRIC_NATS: &str = "wait_fabric_nats";
/// Task deleting NAT instances of networks the VM was the last tenant of.
pub const DESTROY_FABRIC_NATS: &str = "destroy_fabric_nats";

/// Tag marking NAT instances.
pub const NAT_ROLE: &str = "nat";

/// Provisioning state for one fabric network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricNatEntry {
    /// Fabric network
    pub network_uuid: String,
    /// Gateway address the NAT instance answers on
    pub gateway: String,
    /// Ticket serializing work on the network
    #[serde(default)]
    pub ticket_uuid: Option<String>,
    /// The gateway was already provisioned by someone else
    #[serde(default)]
    pub already_provisioned: bool,
    /// NAT instance created by this job
    #[serde(default)]
    pub nat_vm_uuid: Option<String>,
    /// Job provisioning the NAT instance
    #[serde(default)]
    pub job_uuid: Option<String>,
    /// Nothing left to do for this network
    #[serde(default)]
    pub done: bool,
}

impl FabricNatEntry {
    fn new(network_uuid: String, gateway: String) -> Self {
        Self {
            network_uuid,
            gateway,
            ticket_uuid: None,
            already_provisioned: false,
            nat_vm_uuid: None,
            job_uuid: None,
            done: false,
        }
    }
}

/// Distinct `(network, gateway)` pairs among `nics` that need NAT.
pub fn networks_needing_nat(nics: &[Nic]) -> Vec<(String, String)> {
    let mut networks: Vec<(String, String)> = Vec::new();
    for nic in nics {
        if !(nic.fabric && nic.internet_nat) {
            continue;
        }
        let Some(gateway) = &nic.gateway else {
            continue;
        };
        if !networks.iter().any(|(n, _)| *n == nic.network_uuid) {
            networks.push((nic.network_uuid.clone(), gateway.clone()));
        }
    }
    networks
}

fn entries(job: &Job<Scratch>) -> Result<Vec<FabricNatEntry>, TaskError> {
    Ok(job.get_param(keys::FABRIC_NATS)?.unwrap_or_default())
}

fn save(job: &mut Job<Scratch>, entries: &[FabricNatEntry]) -> Result<(), TaskError> {
    job.store_param(keys::FABRIC_NATS, &entries)
}

/// Merge NAT-requiring networks from `nics` into the recorded entries.
fn merge_entries(job: &Job<Scratch>, nics: &[Nic]) -> Result<Vec<FabricNatEntry>, TaskError> {
    let mut entries = entries(job)?;
    for (network_uuid, gateway) in networks_needing_nat(nics) {
        if !entries.iter().any(|e| e.network_uuid == network_uuid) {
            entries.push(FabricNatEntry::new(network_uuid, gateway));
        }
    }
    Ok(entries)
}

// ============================================================================
// Provisioning
// ============================================================================

fn acquire_fabric_nat_tickets<'a>(
    job: &'a mut Job<Scratch>,
    svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let nics: Vec<Nic> = job.get_param(keys::NICS)?.unwrap_or_default();
        let mut entries = merge_entries(job, &nics)?;
        if entries.is_empty() {
            return Ok(TaskOutcome::done("No fabric NATs needed"));
        }
        if svc.config().fabric_nat.is_none() {
            return Err(TaskError::validation(
                "fabric_nat",
                "fabric networks need NAT but no NAT pool is configured",
            ));
        }

        for entry in entries.iter_mut().filter(|e| !e.done) {
            let ticket = tickets::acquire_ticket(
                job,
                svc,
                DEFAULT_TICKET_SERVER,
                FABRIC_NAT_SCOPE,
                &entry.network_uuid,
            )
            .await?;
            entry.ticket_uuid = Some(ticket.uuid);
        }
        save(job, &entries)?;

        Ok(TaskOutcome::done(format!(
            "Acquired {} fabric NAT tickets",
            entries.len()
        )))
    })
}

fn wait_fabric_nat_tickets<'a>(
    job: &'a mut Job<Scratch>,
    svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let entries = entries(job)?;
        let mut active = 0;
        for entry in entries.iter().filter(|e| !e.done) {
            let Some(ticket_uuid) = &entry.ticket_uuid else {
                continue;
            };
            if let TaskOutcome::Poll { after, message } =
                tickets::wait_on_ticket(job, svc, ticket_uuid).await?
            {
                return Ok(TaskOutcome::Poll { after, message });
            }
            active += 1;
        }
        Ok(TaskOutcome::done(format!("{} fabric NAT tickets active", active)))
    })
}

fn provision_fabric_nats<'a>(
    job: &'a mut Job<Scratch>,
    svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let mut entries = entries(job)?;
        let pending: Vec<usize> = (0..entries.len())
            .filter(|&i| !entries[i].done && entries[i].nat_vm_uuid.is_none())
            .collect();
        if pending.is_empty() {
            return Ok(TaskOutcome::done("No fabric NATs to provision"));
        }
        let nat = svc.config().fabric_nat.clone().ok_or_else(|| {
            TaskError::validation("fabric_nat", "no NAT pool is configured")
        })?;
        let owner_uuid = job
            .param_str(keys::OWNER_UUID)
            .map(str::to_string)
            .or_else(|| job.scratch.vm.as_ref().and_then(|vm| vm.owner_uuid.clone()));

        let mut created = 0;
        for i in pending {
            let network_uuid = entries[i].network_uuid.clone();
            let network = svc.napi().get_network(&network_uuid).await?;

            if network.gateway_provisioned {
                info!(
                    job_id = %job.id,
                    network_uuid = %network_uuid,
                    "Gateway already provisioned, releasing ticket"
                );
                entries[i].already_provisioned = true;
                entries[i].done = true;
                tickets::release_held_ticket(job, svc, FABRIC_NAT_SCOPE, &network_uuid).await;
                save(job, &entries)?;
                continue;
            }

            let payload = json!({
                "uuid": network_uuid,
                "alias": format!("nat-{}", network_uuid),
                "owner_uuid": owner_uuid,
                "image_uuid": nat.image_uuid,
                "billing_id": nat.billing_id,
                "networks": [
                    { "uuid": nat.nat_pool, "primary": true },
                    { "uuid": network_uuid, "ip": entries[i].gateway, "allow_ip_spoofing": true }
                ],
                "tags": {
                    "smartdc_role": NAT_ROLE,
                    "fabric_nat_ticket": entries[i].ticket_uuid,
                },
            });

            match svc.vmapi().create_vm(&payload).await {
                Ok(response) => {
                    info!(
                        job_id = %job.id,
                        network_uuid = %network_uuid,
                        nat_job = %response.job_uuid,
                        "NAT instance provisioning"
                    );
                    entries[i].nat_vm_uuid = Some(response.vm_uuid);
                    entries[i].job_uuid = Some(response.job_uuid);
                    created += 1;
                }
                // Created by an earlier attempt of this task
                Err(e) if e.is_conflict() => {
                    entries[i].nat_vm_uuid = Some(network_uuid.clone());
                }
                Err(e) => {
                    tickets::release_held_ticket(job, svc, FABRIC_NAT_SCOPE, &network_uuid).await;
                    entries[i].done = true;
                    save(job, &entries)?;
                    return Err(e.into());
                }
            }
            save(job, &entries)?;
        }

        Ok(TaskOutcome::done(format!("Provisioning {} NAT instances", created)))
    })
}

fn wait_fabric_nats<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let mut entries = entries(job)?;
        let mut pending = 0;

        for i in 0..entries.len() {
            if entries[i].done {
                continue;
            }
            let Some(nat_vm_uuid) = entries[i].nat_vm_uuid.clone() else {
                continue;
            };
            match svc.vmapi().get_vm(&nat_vm_uuid, false).await {
                Ok(vm) if vm.state == VmState::Running => {
                    let network_uuid = entries[i].network_uuid.clone();
                    entries[i].done = true;
                    tickets::release_held_ticket(job, svc, FABRIC_NAT_SCOPE, &network_uuid).await;
                    save(job, &entries)?;
                }
                Ok(vm) if vm.state == VmState::Failed => {
                    return Err(TaskError::AgentTaskFailed {
                        task_id: entries[i].job_uuid.clone().unwrap_or(nat_vm_uuid),
                        message: format!(
                            "NAT instance for network {} failed to provision",
                            entries[i].network_uuid
                        ),
                    });
                }
                Ok(_) => pending += 1,
                Err(e) if e.is_not_found() => pending += 1,
                Err(e) => return Err(e.into()),
            }
        }

        if pending > 0 {
            return Ok(TaskOutcome::poll(
                svc.config().task_poll_interval,
                format!("Waiting for {} NAT instances", pending),
            ));
        }
        Ok(TaskOutcome::done("Fabric NATs running"))
    })
}

// ============================================================================
// Teardown
// ============================================================================

/// NICs on `network_uuid` other than the gateway's and `leaving_vm`'s.
async fn count_tenants(
    svc: &Services,
    network_uuid: &str,
    gateway: &str,
    leaving_vm: &str,
) -> Result<usize, TaskError> {
    let nics = svc
        .napi()
        .list_nics(&NicFilter {
            network_uuid: Some(network_uuid.to_string()),
            ..Default::default()
        })
        .await?;
    Ok(nics
        .iter()
        .filter(|n| n.ip.as_deref() != Some(gateway))
        .filter(|n| n.belongs_to_uuid != network_uuid && n.belongs_to_uuid != leaving_vm)
        .count())
}

fn destroy_fabric_nats<'a>(
    job: &'a mut Job<Scratch>,
    svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = job.require_str(keys::VM_UUID)?.to_string();
        let removed: Vec<Nic> = job.get_param(keys::REMOVED_NICS)?.unwrap_or_default();
        let mut entries = merge_entries(job, &removed)?;
        if entries.is_empty() {
            return Ok(TaskOutcome::done("No fabric NATs to check"));
        }

        let mut destroyed = 0;
        for i in 0..entries.len() {
            if entries[i].done {
                continue;
            }
            let network_uuid = entries[i].network_uuid.clone();
            let gateway = entries[i].gateway.clone();

            if count_tenants(svc, &network_uuid, &gateway, &vm_uuid).await? > 0 {
                entries[i].done = true;
                tickets::release_held_ticket(job, svc, FABRIC_NAT_SCOPE, &network_uuid).await;
                save(job, &entries)?;
                continue;
            }

            let ticket = tickets::acquire_ticket(
                job,
                svc,
                DEFAULT_TICKET_SERVER,
                FABRIC_NAT_SCOPE,
                &network_uuid,
            )
            .await?;
            entries[i].ticket_uuid = Some(ticket.uuid.clone());
            save(job, &entries)?;
            if let TaskOutcome::Poll { after, message } =
                tickets::wait_on_ticket(job, svc, &ticket.uuid).await?
            {
                return Ok(TaskOutcome::Poll { after, message });
            }

            // A provision may have joined the network while we queued
            let tenants = count_tenants(svc, &network_uuid, &gateway, &vm_uuid).await?;
            if tenants > 0 {
                info!(
                    job_id = %job.id,
                    network_uuid = %network_uuid,
                    tenants,
                    "Network gained tenants, NAT instance kept"
                );
                entries[i].done = true;
                tickets::release_held_ticket(job, svc, FABRIC_NAT_SCOPE, &network_uuid).await;
                save(job, &entries)?;
                continue;
            }

            match svc.vmapi().delete_vm(&network_uuid).await {
                Ok(response) => {
                    info!(
                        job_id = %job.id,
                        network_uuid = %network_uuid,
                        nat_job = %response.job_uuid,
                        "Last tenant gone, NAT instance deleted"
                    );
                    destroyed += 1;
                }
                Err(e) if e.is_not_found() => {
                    warn!(job_id = %job.id, network_uuid = %network_uuid, "NAT instance already gone");
                }
                Err(e) => return Err(e.into()),
            }

            entries[i].done = true;
            tickets::release_held_ticket(job, svc, FABRIC_NAT_SCOPE, &network_uuid).await;
            save(job, &entries)?;
        }

        Ok(TaskOutcome::done(format!("{} NAT instances deleted", destroyed)))
    })
}

/// Register the fabric NAT tasks.
pub fn register(registry: &mut TaskRegistry<Services>) -> Result<(), DefinitionError> {
    registry.register(
        TaskDescriptor::new(ACQUIRE_FABRIC_NAT_TICKETS, acquire_fabric_nat_tickets)
            .with_timeout(Duration::from_secs(30))
            .with_retry(2)
            .requires(capability::CNAPI),
    )?;
    registry.register(
        TaskDescriptor::new(WAIT_FABRIC_NAT_TICKETS, wait_fabric_nat_tickets)
            .with_timeout(Duration::from_secs(600))
            .with_retry(1)
            .requires(capability::CNAPI),
    )?;
    registry.register(
        TaskDescriptor::new(PROVISION_FABRIC_NATS, provision_fabric_nats)
            .with_timeout(Duration::from_secs(60))
            .with_retry(2)
            .requires(capability::NAPI)
            .requires(capability::VMAPI)
            .requires(capability::CNAPI),
    )?;
    registry.register(
        TaskDescriptor::new(WAIT_FABRIC_NATS, wait_fabric_nats)
            .with_timeout(Duration::from_secs(900))
            .with_retry(1)
            .requires(capability::VMAPI),
    )?;
    registry.register(
        TaskDescriptor::new(DESTROY_FABRIC_NATS, destroy_fabric_nats)
            .with_timeout(Duration::from_secs(600))
            .with_retry(2)
            .requires(capability::NAPI)
            .requires(capability::VMAPI)
            .requires(capability::CNAPI),
    )?;
    Ok(())
}
