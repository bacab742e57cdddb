// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! NIC provisioning and removal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, warn};
use vmflow_clients::{CreateNic, Nic, NicFilter};
use vmflow_core::{
    BoxFuture, DefinitionError, Job, TaskDescriptor, TaskError, TaskOutcome, TaskRegistry,
    TaskResult,
};

use crate::keys;
use crate::scratch::Scratch;
use crate::services::{Services, capability};

/// Task creating NICs for `params.networks`.
pub const PROVISION_NICS: &str = "provision_nics";
/// Task deleting the NICs in `params.macs`, or every NIC of the VM.
pub const DELETE_NICS: &str = "delete_nics";
/// Recovery task deleting NICs this job created.
pub const REMOVE_ADDED_NICS: &str = "remove_added_nics";

/// One entry of `params.networks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    /// Network to attach to
    pub uuid: String,
    /// Fixed address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Make this the primary NIC
    #[serde(default)]
    pub primary: bool,
}

/// Distinct NIC tags of `networks`, sorted, for placement.
///
/// Networks without a tag add nothing.
pub(crate) async fn nic_tags<'n>(
    svc: &Services,
    networks: impl IntoIterator<Item = &'n str>,
) -> Result<Vec<String>, TaskError> {
    let uuids: BTreeSet<&str> = networks.into_iter().collect();
    let mut tags = BTreeSet::new();
    for uuid in uuids {
        if let Some(tag) = svc.napi().get_network(uuid).await?.nic_tag {
            tags.insert(tag);
        }
    }
    Ok(tags.into_iter().collect())
}

fn nic_list(job: &Job<Scratch>, key: &str) -> Result<Vec<Nic>, TaskError> {
    Ok(job.get_param(key)?.unwrap_or_default())
}

fn provision_nics<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = job.require_str(keys::VM_UUID)?.to_string();
        let owner_uuid = job.param_str(keys::OWNER_UUID).map(str::to_string);
        let requests: Vec<NetworkRequest> = job.get_param(keys::NETWORKS)?.unwrap_or_default();

        // Entries are created in request order, so a retry resumes after the
        // NICs an earlier attempt already created.
        let mut nics = nic_list(job, keys::NICS)?;
        let mut added: Vec<String> = job.get_param(keys::ADDED_NICS)?.unwrap_or_default();

        for request in requests.iter().skip(nics.len()) {
            let nic = svc
                .napi()
                .create_nic(&CreateNic {
                    network_uuid: request.uuid.clone(),
                    belongs_to_uuid: vm_uuid.clone(),
                    belongs_to_type: "zone".to_string(),
                    owner_uuid: owner_uuid.clone(),
                    ip: request.ip.clone(),
                    primary: request.primary,
                })
                .await?;

            info!(
                job_id = %job.id,
                vm_uuid = %vm_uuid,
                mac = %nic.mac,
                network_uuid = %nic.network_uuid,
                "NIC created"
            );
            added.push(nic.mac.clone());
            nics.push(nic);
            job.store_param(keys::NICS, &nics)?;
            job.store_param(keys::ADDED_NICS, &added)?;
        }

        Ok(TaskOutcome::done(format!("{} NICs provisioned", nics.len())))
    })
}

fn delete_nics<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let vm_uuid = job.require_str(keys::VM_UUID)?.to_string();
        let macs: Option<Vec<String>> = job.get_param(keys::MACS)?;

        let owned = svc
            .napi()
            .list_nics(&NicFilter {
                belongs_to_uuid: Some(vm_uuid.clone()),
                ..Default::default()
            })
            .await?;
        let targets: Vec<Nic> = match &macs {
            Some(macs) => owned.into_iter().filter(|n| macs.contains(&n.mac)).collect(),
            None => owned,
        };

        let mut removed = nic_list(job, keys::REMOVED_NICS)?;
        let mut deleted = 0;
        for nic in targets {
            if !removed.iter().any(|r| r.mac == nic.mac) {
                removed.push(nic.clone());
                job.store_param(keys::REMOVED_NICS, &removed)?;
            }
            match svc.napi().delete_nic(&nic.mac).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(TaskOutcome::done(format!("{} NICs deleted", deleted)))
    })
}

fn remove_added_nics<'a>(job: &'a mut Job<Scratch>, svc: &'a Services) -> BoxFuture<'a, TaskResult> {
    Box::pin(async move {
        let added: Vec<String> = match job.get_param(keys::ADDED_NICS) {
            Ok(added) => added.unwrap_or_default(),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Ignoring malformed added_nics");
                Vec::new()
            }
        };

        let mut left = Vec::new();
        for mac in added {
            match svc.napi().delete_nic(&mac).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(job_id = %job.id, mac = %mac, error = %e, "Failed to remove NIC");
                    left.push(mac);
                }
            }
        }

        if left.is_empty() {
            job.remove_param(keys::ADDED_NICS);
            job.remove_param(keys::NICS);
            Ok(TaskOutcome::done("Removed NICs added by this job"))
        } else {
            let message = format!("{} NICs could not be removed", left.len());
            job.store_param(keys::ADDED_NICS, &left)?;
            Ok(TaskOutcome::done(message))
        }
    })
}

/// Register the NIC tasks.
pub fn register(registry: &mut TaskRegistry<Services>) -> Result<(), DefinitionError> {
    registry.register(
        TaskDescriptor::new(PROVISION_NICS, provision_nics)
            .with_timeout(Duration::from_secs(60))
            .with_retry(2)
            .requires(capability::NAPI),
    )?;
    registry.register(
        TaskDescriptor::new(DELETE_NICS, delete_nics)
            .with_timeout(Duration::from_secs(60))
            .with_retry(2)
            .requires(capability::NAPI),
    )?;
    registry.register(
        TaskDescriptor::new(REMOVE_ADDED_NICS, remove_added_nics)
            .with_timeout(Duration::from_secs(60))
            .requires(capability::NAPI),
    )?;
    Ok(())
}
