// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service clients for vmflow.
//!
//! Workflow tasks talk to five control-plane services. Each is an
//! `async_trait` interface with a reqwest-backed adapter:
//!
//! | Interface          | Service          | Used for                                   |
//! |--------------------|------------------|--------------------------------------------|
//! | [`CnapiClient`]    | compute nodes    | agent tasks, waitlist tickets, raw VM load  |
//! | [`VmapiClient`]    | VM inventory     | VM lookup, NAT provisioning, migrations     |
//! | [`NapiClient`]     | networking       | NICs, networks, IP reservations             |
//! | [`AllocatorClient`]| placement        | choosing a migration target                 |
//! | [`JobsClient`]     | job service      | cancelling jobs                             |
//!
//! [`MockFleet`] implements all five in memory for tests.
//!
//! Every call returns [`ClientError`], which converts into
//! [`vmflow_core::TaskError`] so tasks can use `?` directly: transport
//! failures, conflicts and 5xx responses become retryable, everything else
//! fails the task.

#![deny(missing_docs)]

pub mod allocator;
pub mod cnapi;
pub mod error;
pub mod http;
pub mod jobs;
pub mod mock;
pub mod napi;
pub mod types;
pub mod vmapi;

pub use allocator::{AllocatorClient, HttpAllocatorClient};
pub use cnapi::{CnapiClient, HttpCnapiClient};
pub use error::{ClientError, Result};
pub use http::HttpClient;
pub use jobs::{HttpJobsClient, JobsClient};
pub use mock::MockFleet;
pub use napi::{HttpNapiClient, NapiClient};
pub use types::*;
pub use vmapi::{HttpVmapiClient, VmapiClient};
