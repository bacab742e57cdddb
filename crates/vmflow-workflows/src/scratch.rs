// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transient per-run job state.

use vmflow_clients::Vm;

use crate::zone_action::ZoneRequest;

/// Values computed by one task and read by the next within a single run.
///
/// Nothing here survives a restart; compensation tasks re-read services
/// instead of trusting it.
#[derive(Debug, Default)]
pub struct Scratch {
    /// Request built by the last `setup_*_request` task
    pub request: Option<ZoneRequest>,
    /// VM as last loaded from inventory
    pub vm: Option<Vm>,
}
