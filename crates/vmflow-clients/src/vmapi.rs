// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inventory service: VM records, provisioning and migration records.
//!
//! Migration records are stored as JSON documents. The schema belongs to the
//! workflow layer; this interface only enforces the compare-and-swap on the
//! document's `version` field.

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

use crate::error::Result;
use crate::http::HttpClient;
use crate::types::{CreateVmResponse, JobResponse, MigrationProgressEvent, Vm, VmFilter};

/// Inventory and migration record service.
#[async_trait]
pub trait VmapiClient: Send + Sync {
    /// `GET /vms/{uuid}`; hidden VMs only when `include_dni` is set.
    async fn get_vm(&self, vm_uuid: &str, include_dni: bool) -> Result<Vm>;

    /// `GET /vms?...`; never returns hidden VMs.
    async fn list_vms(&self, filter: &VmFilter) -> Result<Vec<Vm>>;

    /// `POST /vms`
    async fn create_vm(&self, payload: &Value) -> Result<CreateVmResponse>;

    /// `DELETE /vms/{uuid}`
    async fn delete_vm(&self, vm_uuid: &str) -> Result<JobResponse>;

    /// `POST /migrations/{vm}/store`
    ///
    /// `record.version` must equal the stored version (0 when creating).
    /// Returns the new version; a mismatch fails with `Conflict`.
    async fn store_migration(&self, vm_uuid: &str, record: &Value) -> Result<u64>;

    /// `POST /migrations/{vm}/progress`
    async fn post_migration_progress(
        &self,
        vm_uuid: &str,
        event: &MigrationProgressEvent,
    ) -> Result<()>;

    /// `GET /migrations/{vm}?format=raw`
    async fn get_migration(&self, vm_uuid: &str) -> Result<Value>;

    /// `POST /vms/{vm}?action=migrate&migration_action={action}`
    async fn migrate(&self, vm_uuid: &str, action: &str) -> Result<JobResponse>;
}

/// reqwest-backed [`VmapiClient`].
#[derive(Debug, Clone)]
pub struct HttpVmapiClient {
    http: HttpClient,
}

impl HttpVmapiClient {
    /// Create a client rooted at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new("vmapi", base_url, timeout)?,
        })
    }
}

#[derive(Deserialize)]
struct StoreResponse {
    version: u64,
}

#[async_trait]
impl VmapiClient for HttpVmapiClient {
    async fn get_vm(&self, vm_uuid: &str, include_dni: bool) -> Result<Vm> {
        let path = format!("/vms/{}", vm_uuid);
        if include_dni {
            self.http.get_query(&path, &[("include_dni", "true")]).await
        } else {
            self.http.get(&path).await
        }
    }

    async fn list_vms(&self, filter: &VmFilter) -> Result<Vec<Vm>> {
        self.http.get_query("/vms", filter).await
    }

    async fn create_vm(&self, payload: &Value) -> Result<CreateVmResponse> {
        self.http.post("/vms", payload).await
    }

    async fn delete_vm(&self, vm_uuid: &str) -> Result<JobResponse> {
        let path = format!("/vms/{}", vm_uuid);
        self.http
            .send_json(&path, self.http.request(Method::DELETE, &path))
            .await
    }

    async fn store_migration(&self, vm_uuid: &str, record: &Value) -> Result<u64> {
        let path = format!("/migrations/{}/store", vm_uuid);
        let response: StoreResponse = self.http.post(&path, record).await?;
        Ok(response.version)
    }

    async fn post_migration_progress(
        &self,
        vm_uuid: &str,
        event: &MigrationProgressEvent,
    ) -> Result<()> {
        let path = format!("/migrations/{}/progress", vm_uuid);
        self.http
            .send(&path, self.http.request(Method::POST, &path).json(event))
            .await?;
        Ok(())
    }

    async fn get_migration(&self, vm_uuid: &str) -> Result<Value> {
        let path = format!("/migrations/{}", vm_uuid);
        self.http.get_query(&path, &[("format", "raw")]).await
    }

    async fn migrate(&self, vm_uuid: &str, action: &str) -> Result<JobResponse> {
        let path = format!("/vms/{}", vm_uuid);
        let request = self
            .http
            .request(Method::POST, &path)
            .query(&[("action", "migrate"), ("migration_action", action)])
            .json(&json!({}));
        self.http.send_json(&path, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> HttpVmapiClient {
        HttpVmapiClient::new(server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_get_vm_with_and_without_hidden() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/vms/vm-1"))
            .and(query_param("include_dni", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uuid": "vm-1", "server_uuid": "cn-2", "state": "stopped", "do_not_inventory": true
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/vms/vm-2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let vmapi = client(&server).await;
        assert!(vmapi.get_vm("vm-1", true).await.unwrap().do_not_inventory);
        assert!(vmapi.get_vm("vm-2", false).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_store_migration_conflict() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/migrations/vm-1/store"))
            .and(body_partial_json(json!({"version": 3})))
            .respond_with(ResponseTemplate::new(409).set_body_string("version mismatch"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/migrations/vm-1/store"))
            .and(body_partial_json(json!({"version": 4})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": 5})))
            .mount(&server)
            .await;

        let vmapi = client(&server).await;
        let err = vmapi
            .store_migration("vm-1", &json!({"version": 3, "phase": "sync"}))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let version = vmapi
            .store_migration("vm-1", &json!({"version": 4, "phase": "sync"}))
            .await
            .unwrap();
        assert_eq!(version, 5);
    }

    #[tokio::test]
    async fn test_get_migration_raw_format() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/migrations/vm-1"))
            .and(query_param("format", "raw"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"phase": "begin", "version": 1})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let record = client(&server).await.get_migration("vm-1").await.unwrap();
        assert_eq!(record["phase"], "begin");
    }

    #[tokio::test]
    async fn test_migrate_query_parameters() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/vms/vm-1"))
            .and(query_param("action", "migrate"))
            .and(query_param("migration_action", "begin"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"job_uuid": "job-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let job = client(&server).await.migrate("vm-1", "begin").await.unwrap();
        assert_eq!(job.job_uuid, "job-1");
    }
}
