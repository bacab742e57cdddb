// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for vmflow-workflows scenario tests.
//!
//! Provides a seeded [`MockFleet`], a [`Harness`] running catalog workflows
//! against it, and a fake migration process speaking the sync protocol.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_util::codec::{Framed, LinesCodec};

use vmflow_clients::{AgentProcess, MockFleet, Network, Nic, Vm, VmState};
use vmflow_core::{CancellationToken, ChainExecutor, Config, FabricNatConfig, Job, JobStatus};
use vmflow_workflows::{Catalog, MigrationAction, MigrationRecord, Scratch, Services};

pub const CN_SOURCE: &str = "cn-0001";
pub const CN_TARGET: &str = "cn-0002";
pub const VM_UUID: &str = "4a2b7a3e-5d0c-4f6e-9e1d-0c7a1e5b9f01";
pub const OWNER_UUID: &str = "930896af-bf8c-48d4-885c-6573a94b1853";

pub const EXTERNAL_NET: &str = "net-external";
pub const FABRIC_NET: &str = "net-fabric";
pub const NAT_POOL: &str = "net-nat-pool";
pub const FABRIC_GATEWAY: &str = "192.168.128.1";

// ============================================================================
// Fixtures
// ============================================================================

pub fn config() -> Config {
    Config::new("http://cnapi", "http://vmapi", "http://napi")
        .with_task_poll_interval(Duration::from_millis(5))
        .with_sync_stop_timeout(Duration::from_millis(500))
        .with_sync_progress_interval(Duration::from_millis(10))
        .with_fabric_nat(FabricNatConfig {
            nat_pool: NAT_POOL.to_string(),
            image_uuid: "img-nat".to_string(),
            billing_id: "pkg-nat".to_string(),
        })
}

pub fn external_network() -> Network {
    Network {
        uuid: EXTERNAL_NET.to_string(),
        name: "external".to_string(),
        nic_tag: Some("external".to_string()),
        gateway: Some("10.88.0.1".to_string()),
        gateway_provisioned: false,
        fabric: false,
        internet_nat: false,
        vlan_id: None,
    }
}

pub fn fabric_network() -> Network {
    Network {
        uuid: FABRIC_NET.to_string(),
        name: "my-fabric".to_string(),
        nic_tag: Some("sdc_overlay".to_string()),
        gateway: Some(FABRIC_GATEWAY.to_string()),
        gateway_provisioned: false,
        fabric: true,
        internet_nat: true,
        vlan_id: Some(2),
    }
}

pub fn nat_pool_network() -> Network {
    Network {
        uuid: NAT_POOL.to_string(),
        name: "nat-pool".to_string(),
        nic_tag: Some("external".to_string()),
        gateway: Some("10.99.0.1".to_string()),
        gateway_provisioned: false,
        fabric: false,
        internet_nat: false,
        vlan_id: None,
    }
}

pub fn nic(mac: &str, ip: &str, network: &Network, owner: &str) -> Nic {
    Nic {
        mac: mac.to_string(),
        ip: Some(ip.to_string()),
        network_uuid: network.uuid.clone(),
        belongs_to_uuid: owner.to_string(),
        belongs_to_type: "zone".to_string(),
        primary: true,
        gateway: network.gateway.clone(),
        fabric: network.fabric,
        internet_nat: network.internet_nat,
    }
}

/// A running VM on the source server with one external NIC.
pub fn running_vm() -> Vm {
    let mut vm = Vm::new(VM_UUID, CN_SOURCE, VmState::Running);
    vm.owner_uuid = Some(OWNER_UUID.to_string());
    vm.brand = Some("joyent".to_string());
    vm.image_uuid = Some("img-base".to_string());
    vm.billing_id = Some("pkg-small".to_string());
    vm.ram = Some(1024);
    vm.alias = Some("web0".to_string());
    vm.quota = Some(25);
    vm.indestructible_zoneroot = true;
    vm.nics = vec![nic("90:b8:d0:00:00:01", "10.88.0.5", &external_network(), VM_UUID)];
    vm
}

/// Two servers and the external, fabric and NAT pool networks.
pub async fn seeded_fleet() -> MockFleet {
    let fleet = MockFleet::new();
    fleet.add_server(CN_SOURCE).await;
    fleet.add_server(CN_TARGET).await;
    fleet.add_network(external_network()).await;
    fleet.add_network(fabric_network()).await;
    fleet.add_network(nat_pool_network()).await;
    fleet
}

pub fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Runs catalog workflows against a fleet.
pub struct Harness {
    pub fleet: MockFleet,
    pub services: Arc<Services>,
    pub catalog: Catalog,
    pub executor: ChainExecutor<Services>,
    shutdown: CancellationToken,
}

impl Harness {
    pub fn new(fleet: MockFleet) -> Self {
        Self::build(fleet, false)
    }

    /// Like [`Harness::new`], with progress notices posted to the fleet.
    pub fn with_progress(fleet: MockFleet) -> Self {
        Self::build(fleet, true)
    }

    fn build(fleet: MockFleet, progress: bool) -> Self {
        let shutdown = CancellationToken::new();
        let mut services = Services::from_fleet(config(), fleet.clone());
        if progress {
            let (with_worker, _handle) = services.with_progress_worker(shutdown.clone());
            services = with_worker;
        }
        let catalog = Catalog::build(&services).expect("catalog builds");
        let services = Arc::new(services);
        let executor =
            ChainExecutor::new(services.clone()).with_retry_delay(Duration::from_millis(5));
        Self {
            fleet,
            services,
            catalog,
            executor,
            shutdown,
        }
    }

    /// Run `workflow` to completion.
    pub async fn run(&self, workflow: &str, params: Value) -> Job<Scratch> {
        let def = self.catalog.get(workflow).expect("workflow in catalog");
        let job = def.new_job(self::params(params));
        self.executor.spawn(def, job).join().await.expect("job task panicked")
    }

    /// Run migration `action` on [`VM_UUID`] to completion.
    pub async fn migrate(&self, action: MigrationAction, extra: Value) -> Job<Scratch> {
        let (def, job) = self
            .catalog
            .migration_job(action, VM_UUID, self::params(extra))
            .expect("migration workflow in catalog");
        self.executor.spawn(def, job).join().await.expect("job task panicked")
    }

    /// The stored migration record of [`VM_UUID`].
    pub async fn record(&self) -> MigrationRecord {
        let value = self.fleet.migration(VM_UUID).await.expect("record stored");
        serde_json::from_value(value).expect("record deserializes")
    }

    pub async fn flush_progress(&self) {
        self.services.flush_progress().await;
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn assert_succeeded(job: &Job<Scratch>) {
    assert_eq!(
        job.status,
        JobStatus::Succeeded,
        "job {} failed: {:?}",
        job.workflow,
        job.error
    );
}

pub fn assert_failed_with(job: &Job<Scratch>, code: &str) {
    assert_eq!(job.status, JobStatus::Failed, "job {} did not fail", job.workflow);
    let error = job.error.as_ref().expect("failed job records its error");
    assert_eq!(error.code, code, "unexpected error: {:?}", error);
}

// ============================================================================
// Fake migration process
// ============================================================================

/// A TCP server answering the migration sync protocol.
///
/// Every request is answered with a `response` (`end` for `end`) echoing
/// its `eventId`; `sync` first reports two progress messages. With
/// `sync_error` set, `sync` is answered with an `error` instead. A held
/// server stops after the first progress message until [`FakeSyncServer::resume`].
pub struct FakeSyncServer {
    pub process: AgentProcess,
    commands: Arc<Mutex<Vec<String>>>,
    hold: Option<Arc<Notify>>,
}

impl FakeSyncServer {
    pub async fn start() -> Self {
        Self::start_with(None, None).await
    }

    pub async fn failing(message: &str) -> Self {
        Self::start_with(Some(message.to_string()), None).await
    }

    pub async fn held() -> Self {
        Self::start_with(None, Some(Arc::new(Notify::new()))).await
    }

    async fn start_with(sync_error: Option<String>, hold: Option<Arc<Notify>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let commands = Arc::new(Mutex::new(Vec::new()));

        let seen = commands.clone();
        let gate = hold.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, seen.clone(), sync_error.clone(), gate.clone()));
            }
        });

        Self {
            process: AgentProcess {
                pid: 4242,
                host: "127.0.0.1".to_string(),
                port,
            },
            commands,
            hold,
        }
    }

    /// Let a held `sync` finish.
    pub fn resume(&self) {
        if let Some(hold) = &self.hold {
            hold.notify_one();
        }
    }

    /// Commands received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Register with `fleet` as the endpoint of `receive` and `sync` tasks.
    pub async fn install(&self, fleet: &MockFleet) {
        fleet.set_sync_endpoint(self.process.clone()).await;
    }
}

async fn serve(
    stream: TcpStream,
    seen: Arc<Mutex<Vec<String>>>,
    sync_error: Option<String>,
    hold: Option<Arc<Notify>>,
) {
    let mut framed = Framed::new(stream, LinesCodec::new());
    while let Some(Ok(line)) = framed.next().await {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            break;
        };
        let command = request["command"].as_str().unwrap_or_default().to_string();
        let event_id = request["eventId"].clone();
        seen.lock().unwrap().push(command.clone());

        let mut replies = Vec::new();
        match (command.as_str(), &sync_error) {
            ("sync", Some(message)) => {
                replies.push(json!({ "type": "error", "eventId": event_id, "message": message }));
            }
            ("sync", None) => {
                for current in [1024, 4096] {
                    let progress = json!({
                        "type": "progress",
                        "current_progress": current,
                        "total_progress": 4096,
                    });
                    if framed.send(progress.to_string()).await.is_err() {
                        return;
                    }
                    if current == 1024
                        && let Some(hold) = &hold
                    {
                        hold.notified().await;
                    }
                }
                replies.push(json!({ "type": "response", "eventId": event_id }));
            }
            ("end", _) => replies.push(json!({ "type": "end", "eventId": event_id })),
            _ => replies.push(json!({ "type": "response", "eventId": event_id })),
        }

        for reply in replies {
            if framed.send(reply.to_string()).await.is_err() {
                return;
            }
        }
        if command == "stop" {
            return;
        }
    }
}
