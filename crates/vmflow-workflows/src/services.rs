// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The execution context handed to every workflow task.
//!
//! [`Services`] bundles the configuration with one client per control-plane
//! service and the detached progress notifier. It is built once per process
//! and shared by every job through the executor.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;
use vmflow_clients::{
    AllocatorClient, ClientError, CnapiClient, HttpAllocatorClient, HttpCnapiClient,
    HttpJobsClient, HttpNapiClient, HttpVmapiClient, JobsClient, MigrationProgressEvent,
    MockFleet, NapiClient, VmapiClient,
};
use vmflow_core::{
    CancellationToken, Capability, Config, DetachedNotifier, ExecutionContext, NotificationSink,
};

use crate::scratch::Scratch;

/// Capabilities a task can declare. Every capability is provided by
/// [`Services`]; declaring an unknown one fails the workflow build.
pub mod capability {
    use vmflow_core::Capability;

    /// Compute-node agent tasks and tickets
    pub const CNAPI: Capability = Capability::new("cnapi");
    /// VM inventory and migration records
    pub const VMAPI: Capability = Capability::new("vmapi");
    /// Networking
    pub const NAPI: Capability = Capability::new("napi");
    /// Placement
    pub const ALLOCATOR: Capability = Capability::new("allocator");
    /// Job service
    pub const JOBS: Capability = Capability::new("jobs");
    /// Direct connections to cn-agent migration processes
    pub const SYNC: Capability = Capability::new("sync");

    pub(crate) const ALL: [Capability; 6] = [CNAPI, VMAPI, NAPI, ALLOCATOR, JOBS, SYNC];
}

/// A migration progress event addressed to a VM.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressNotice {
    /// VM being migrated
    pub vm_uuid: String,
    /// Event body
    pub event: MigrationProgressEvent,
}

/// Delivers [`ProgressNotice`]s to the inventory service.
pub struct ProgressSink {
    vmapi: Arc<dyn VmapiClient>,
}

impl ProgressSink {
    /// Create a sink posting through `vmapi`.
    pub fn new(vmapi: Arc<dyn VmapiClient>) -> Self {
        Self { vmapi }
    }
}

#[async_trait]
impl NotificationSink for ProgressSink {
    type Event = ProgressNotice;

    async fn deliver(
        &self,
        notice: ProgressNotice,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.vmapi
            .post_migration_progress(&notice.vm_uuid, &notice.event)
            .await?;
        Ok(())
    }
}

/// Configuration and service clients shared by all tasks.
#[derive(Clone)]
pub struct Services {
    config: Config,
    cnapi: Arc<dyn CnapiClient>,
    vmapi: Arc<dyn VmapiClient>,
    napi: Arc<dyn NapiClient>,
    allocator: Arc<dyn AllocatorClient>,
    jobs: Arc<dyn JobsClient>,
    progress: Option<DetachedNotifier<ProgressNotice>>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("config", &self.config)
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Assemble a context from explicit clients.
    pub fn new(
        config: Config,
        cnapi: Arc<dyn CnapiClient>,
        vmapi: Arc<dyn VmapiClient>,
        napi: Arc<dyn NapiClient>,
        allocator: Arc<dyn AllocatorClient>,
        jobs: Arc<dyn JobsClient>,
    ) -> Self {
        Self {
            config,
            cnapi,
            vmapi,
            napi,
            allocator,
            jobs,
            progress: None,
        }
    }

    /// Build reqwest-backed clients for every service named in `config`.
    pub fn from_config(config: Config) -> Result<Self, ClientError> {
        let timeout = config.request_timeout;
        let cnapi = Arc::new(HttpCnapiClient::new(&config.cnapi_url, timeout)?);
        let vmapi = Arc::new(HttpVmapiClient::new(&config.vmapi_url, timeout)?);
        let napi = Arc::new(HttpNapiClient::new(&config.napi_url, timeout)?);
        let allocator = Arc::new(HttpAllocatorClient::new(&config.allocator_url, timeout)?);
        let jobs = Arc::new(HttpJobsClient::new(&config.jobs_url, timeout)?);
        Ok(Self::new(config, cnapi, vmapi, napi, allocator, jobs))
    }

    /// Back every service with one in-memory fleet.
    pub fn from_fleet(config: Config, fleet: MockFleet) -> Self {
        let fleet = Arc::new(fleet);
        Self::new(
            config,
            fleet.clone(),
            fleet.clone(),
            fleet.clone(),
            fleet.clone(),
            fleet,
        )
    }

    /// Start the background worker that posts migration progress.
    ///
    /// Without a worker, progress notices are dropped.
    pub fn with_progress_worker(mut self, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let sink = Arc::new(ProgressSink::new(self.vmapi.clone()));
        let (notifier, handle) =
            DetachedNotifier::spawn(sink, self.config.notify_queue_size, shutdown);
        self.progress = Some(notifier);
        (self, handle)
    }

    /// Configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Compute-node agent and ticket service.
    pub fn cnapi(&self) -> &dyn CnapiClient {
        self.cnapi.as_ref()
    }

    /// Inventory service.
    pub fn vmapi(&self) -> &dyn VmapiClient {
        self.vmapi.as_ref()
    }

    /// Network service.
    pub fn napi(&self) -> &dyn NapiClient {
        self.napi.as_ref()
    }

    /// Placement service.
    pub fn allocator(&self) -> &dyn AllocatorClient {
        self.allocator.as_ref()
    }

    /// Job service.
    pub fn jobs(&self) -> &dyn JobsClient {
        self.jobs.as_ref()
    }

    /// Queue a progress notice. Never blocks and never fails.
    pub fn notify_progress(&self, vm_uuid: &str, event: MigrationProgressEvent) {
        match &self.progress {
            Some(notifier) => {
                notifier.notify(ProgressNotice {
                    vm_uuid: vm_uuid.to_string(),
                    event,
                });
            }
            None => debug!(vm_uuid = %vm_uuid, phase = %event.phase, "No progress worker, dropping notice"),
        }
    }

    /// Wait until every queued progress notice has been handled.
    pub async fn flush_progress(&self) {
        if let Some(notifier) = &self.progress {
            notifier.flush().await;
        }
    }
}

impl ExecutionContext for Services {
    type Scratch = Scratch;

    fn provides(&self, capability: Capability) -> bool {
        capability::ALL.contains(&capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> Config {
        Config::new("http://cnapi", "http://vmapi", "http://napi")
    }

    #[test]
    fn test_provides_known_capabilities() {
        let services = Services::from_fleet(config(), MockFleet::new());
        for cap in capability::ALL {
            assert!(services.provides(cap), "{} should be provided", cap);
        }
        assert!(!services.provides(Capability::new("imgapi")));
    }

    #[test]
    fn test_from_config_builds_http_clients() {
        let services = Services::from_config(config()).unwrap();
        assert_eq!(services.config().allocator_url, "http://cnapi");
    }

    #[tokio::test]
    async fn test_progress_worker_posts_to_inventory() {
        let fleet = MockFleet::new();
        let shutdown = CancellationToken::new();
        let (services, handle) =
            Services::from_fleet(config(), fleet.clone()).with_progress_worker(shutdown.clone());

        services.notify_progress(
            "vm-1",
            MigrationProgressEvent {
                phase: "sync".to_string(),
                state: "running".to_string(),
                message: "syncing".to_string(),
                current_progress: 10,
                total_progress: 100,
                job_uuid: None,
            },
        );
        services.flush_progress().await;

        let events = fleet.progress_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "vm-1");
        assert_eq!(events[0].1.current_progress, 10);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
