// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Waitlist tickets.
//!
//! Tickets are the only lock between jobs. Acquiring one is non-blocking and
//! records it in `params.held_tickets`; waiting is a poll loop driven by the
//! executor; releasing treats "not found" as success. Every chain of a
//! workflow that acquires tickets ends with [`RELEASE_HELD_TICKETS`], which
//! never fails.

use chrono::{TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use vmflow_clients::{ClientError, CreateTicket, Ticket, TicketStatus};
use vmflow_core::{
    BoxFuture, DefinitionError, Job, TaskDescriptor, TaskError, TaskOutcome, TaskRegistry,
    TaskResult,
};

use crate::keys;
use crate::scratch::Scratch;
use crate::services::{Services, capability};

/// Scope for per-VM tickets.
pub const VM_SCOPE: &str = "vm";
/// Scope for per-network fabric NAT tickets.
pub const FABRIC_NAT_SCOPE: &str = "fabric_nat";
/// Scope serializing placement decisions.
pub const ALLOCATE_SCOPE: &str = "allocate";
/// Waitlist used for tickets not tied to a compute node.
pub const DEFAULT_TICKET_SERVER: &str = "default";

/// Task acquiring the ticket for `params.vm_uuid` on `params.server_uuid`.
pub const ACQUIRE_VM_TICKET: &str = "acquire_vm_ticket";
/// Task waiting for the VM ticket to become active.
pub const WAIT_VM_TICKET: &str = "wait_vm_ticket";
/// Task releasing every ticket the job holds.
pub const RELEASE_HELD_TICKETS: &str = "release_held_tickets";

/// A ticket recorded in `params.held_tickets`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldTicket {
    /// Ticket uuid
    pub uuid: String,
    /// Scope
    pub scope: String,
    /// Resource identifier
    pub id: String,
    /// Waitlist the ticket lives on
    pub server_uuid: String,
}

/// Tickets the job currently holds.
pub fn held_tickets(job: &Job<Scratch>) -> Vec<HeldTicket> {
    match job.get_param::<Vec<HeldTicket>>(keys::HELD_TICKETS) {
        Ok(held) => held.unwrap_or_default(),
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "Ignoring malformed held_tickets");
            Vec::new()
        }
    }
}

/// The held ticket for `(scope, id)`, if any.
pub fn find_held(job: &Job<Scratch>, scope: &str, id: &str) -> Option<HeldTicket> {
    held_tickets(job)
        .into_iter()
        .find(|t| t.scope == scope && t.id == id)
}

fn save_held(job: &mut Job<Scratch>, held: &[HeldTicket]) {
    if held.is_empty() {
        job.remove_param(keys::HELD_TICKETS);
    } else if let Err(e) = job.store_param(keys::HELD_TICKETS, &held) {
        warn!(job_id = %job.id, error = %e, "Failed to record held tickets");
    }
}

fn forget(job: &mut Job<Scratch>, ticket_uuid: &str) {
    let mut held = held_tickets(job);
    held.retain(|t| t.uuid != ticket_uuid);
    save_held(job, &held);
}

/// Acquire a ticket for `(scope, id)` on `server_uuid`.
///
/// A retry finds the ticket already recorded in `params.held_tickets` and
/// returns it instead of queueing a second one, unless it has since been
/// released or expired.
pub async fn acquire_ticket(
    job: &mut Job<Scratch>,
    svc: &Services,
    server_uuid: &str,
    scope: &str,
    id: &str,
) -> Result<Ticket, TaskError> {
    if let Some(held) = find_held(job, scope, id) {
        match svc.cnapi().get_ticket(&held.uuid).await {
            Ok(ticket) if matches!(ticket.status, TicketStatus::Queued | TicketStatus::Active) => {
                return Ok(ticket);
            }
            Ok(ticket) => {
                debug!(job_id = %job.id, ticket = %ticket.uuid, status = ?ticket.status, "Held ticket is gone, acquiring a new one");
            }
            Err(e) if e.is_not_found() => {
                debug!(job_id = %job.id, ticket = %held.uuid, "Held ticket is gone, acquiring a new one");
            }
            Err(e) => return Err(e.into()),
        }
        forget(job, &held.uuid);
    }

    let expiry = TimeDelta::from_std(svc.config().ticket_expiry)
        .unwrap_or_else(|_| TimeDelta::minutes(10));
    let request = CreateTicket {
        scope: scope.to_string(),
        id: id.to_string(),
        expires_at: Utc::now() + expiry,
    };
    let ticket = svc
        .cnapi()
        .create_ticket(server_uuid, &request)
        .await
        .map_err(|e| TaskError::TicketAcquisition {
            scope: scope.to_string(),
            id: id.to_string(),
            message: e.to_string(),
        })?;

    let mut held = held_tickets(job);
    held.push(HeldTicket {
        uuid: ticket.uuid.clone(),
        scope: scope.to_string(),
        id: id.to_string(),
        server_uuid: server_uuid.to_string(),
    });
    save_held(job, &held);

    info!(
        job_id = %job.id,
        ticket = %ticket.uuid,
        scope = %scope,
        id = %id,
        status = ?ticket.status,
        "Ticket acquired"
    );
    Ok(ticket)
}

/// Check whether a ticket has become active.
///
/// Returns `Poll` while it is queued, and [`TaskError::TicketTimeout`] when
/// the next poll would run past the task deadline.
pub async fn wait_on_ticket(job: &Job<Scratch>, svc: &Services, ticket_uuid: &str) -> TaskResult {
    let ticket = svc.cnapi().wait_ticket(ticket_uuid).await?;
    let interval = svc.config().task_poll_interval;

    match ticket.status {
        TicketStatus::Active => Ok(TaskOutcome::done(format!("Ticket {} is active", ticket.uuid))),
        TicketStatus::Queued if job.would_exceed_deadline(interval) => Err(TaskError::TicketTimeout {
            ticket: ticket.uuid,
        }),
        TicketStatus::Queued => Ok(TaskOutcome::poll(
            interval,
            format!("Ticket {} is queued", ticket.uuid),
        )),
        TicketStatus::Released | TicketStatus::Expired => Err(TaskError::TicketAcquisition {
            scope: ticket.scope,
            id: ticket.id,
            message: format!("ticket {} ended before it became active", ticket.uuid),
        }),
    }
}

/// Release a ticket. A ticket that no longer exists counts as released.
pub async fn release_ticket(svc: &Services, ticket_uuid: &str) -> Result<(), ClientError> {
    match svc.cnapi().release_ticket(ticket_uuid).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!(ticket = %ticket_uuid, "Ticket already released or expired");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Release the held ticket for `(scope, id)`. Failures are logged.
pub async fn release_held_ticket(job: &mut Job<Scratch>, svc: &Services, scope: &str, id: &str) -> bool {
    let Some(held) = find_held(job, scope, id) else {
        return true;
    };
    match release_ticket(svc, &held.uuid).await {
        Ok(()) => {
            forget(job, &held.uuid);
            info!(job_id = %job.id, ticket = %held.uuid, scope = %scope, id = %id, "Ticket released");
            true
        }
        Err(e) => {
            warn!(job_id = %job.id, ticket = %held.uuid, error = %e, "Failed to release ticket");
            false
        }
    }
}

/// Release every held ticket. Returns `(released, failed)`.
///
/// Tickets that fail to release stay recorded so a later chain can try
/// again; they expire on their own otherwise.
pub async fn release_held(job: &mut Job<Scratch>, svc: &Services) -> (usize, usize) {
    let mut released = 0;
    let mut failed = 0;
    for held in held_tickets(job) {
        match release_ticket(svc, &held.uuid).await {
            Ok(()) => {
                forget(job, &held.uuid);
                released += 1;
            }
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    ticket = %held.uuid,
                    scope = %held.scope,
                    error = %e,
                    "Failed to release ticket"
                );
                failed += 1;
            }
        }
    }
    (released, failed)
}

// ============================================================================
// Tasks
// ============================================================================

fn acquire_vm_ticket<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = job.require_str(keys::VM_UUID)?.to_string();
        let server_uuid = job.require_str(keys::SERVER_UUID)?.to_string();
        let ticket = acquire_ticket(job, svc, &server_uuid, VM_SCOPE, &vm_uuid).await?;
        Ok(TaskOutcome::done(format!(
            "Ticket {} acquired ({:?})",
            ticket.uuid, ticket.status
        )))
    })
}

fn wait_vm_ticket<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = job.require_str(keys::VM_UUID)?;
        let held = find_held(job, VM_SCOPE, vm_uuid)
            .ok_or_else(|| TaskError::validation(keys::HELD_TICKETS, "no VM ticket held"))?;
        wait_on_ticket(job, svc, &held.uuid).await
    })
}

fn release_held_tickets<'a>(
    job: &'a mut Job<Scratch>,
    svc: &'a Services,
) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let (released, failed) = release_held(job, svc).await;
        if failed > 0 {
            return Ok(TaskOutcome::done(format!(
                "Released {} tickets, {} left to expire",
                released, failed
            )));
        }
        Ok(TaskOutcome::done(format!("Released {} tickets", released)))
    })
}

/// Register the ticket tasks.
pub fn register(registry: &mut TaskRegistry<Services>) -> Result<(), DefinitionError> {
    registry.register(
        TaskDescriptor::new(ACQUIRE_VM_TICKET, acquire_vm_ticket)
            .with_timeout(Duration::from_secs(30))
            .with_retry(2)
            .requires(capability::CNAPI),
    )?;
    registry.register(
        TaskDescriptor::new(WAIT_VM_TICKET, wait_vm_ticket)
            .with_timeout(Duration::from_secs(600))
            .with_retry(1)
            .requires(capability::CNAPI),
    )?;
    registry.register(
        TaskDescriptor::new(RELEASE_HELD_TICKETS, release_held_tickets)
            .with_timeout(Duration::from_secs(60))
            .requires(capability::CNAPI),
    )?;
    Ok(())
}
