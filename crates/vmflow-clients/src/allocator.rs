// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Placement service.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::http::HttpClient;
use crate::types::{Allocation, AllocationRequest};

/// Chooses a server for a VM.
#[async_trait]
pub trait AllocatorClient: Send + Sync {
    /// `POST /allocate`
    async fn allocate(&self, request: &AllocationRequest) -> Result<Allocation>;
}

/// reqwest-backed [`AllocatorClient`].
#[derive(Debug, Clone)]
pub struct HttpAllocatorClient {
    http: HttpClient,
}

impl HttpAllocatorClient {
    /// Create a client rooted at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new("allocator", base_url, timeout)?,
        })
    }
}

#[async_trait]
impl AllocatorClient for HttpAllocatorClient {
    async fn allocate(&self, request: &AllocationRequest) -> Result<Allocation> {
        self.http.post("/allocate", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_allocate_excludes_servers() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/allocate"))
            .and(body_partial_json(json!({"vm_uuid": "vm-1", "exclude_servers": ["cn-1"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"server_uuid": "cn-2"})))
            .expect(1)
            .mount(&server)
            .await;

        let allocator = HttpAllocatorClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let allocation = allocator
            .allocate(&AllocationRequest {
                vm_uuid: "vm-1".to_string(),
                exclude_servers: vec!["cn-1".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(allocation.server_uuid, "cn-2");
    }
}
