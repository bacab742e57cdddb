// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Network service: NICs, networks, IP reservations and NIC tags.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::error::Result;
use crate::http::HttpClient;
use crate::types::{CreateNic, IpEntry, Network, Nic, NicFilter, NicTag};

/// Network service.
#[async_trait]
pub trait NapiClient: Send + Sync {
    /// `GET /nics?...`
    async fn list_nics(&self, filter: &NicFilter) -> Result<Vec<Nic>>;

    /// `POST /nics`
    async fn create_nic(&self, request: &CreateNic) -> Result<Nic>;

    /// `DELETE /nics/{mac}`
    async fn delete_nic(&self, mac: &str) -> Result<()>;

    /// `GET /networks/{uuid}`
    async fn get_network(&self, network_uuid: &str) -> Result<Network>;

    /// `GET /networks/{uuid}/ips/{ip}`
    async fn get_ip(&self, network_uuid: &str, ip: &str) -> Result<IpEntry>;

    /// `PUT /networks/{uuid}/ips/{ip}` with `{reserved}`
    async fn set_ip_reserved(&self, network_uuid: &str, ip: &str, reserved: bool)
    -> Result<IpEntry>;

    /// `GET /nic_tags`
    async fn list_nic_tags(&self) -> Result<Vec<NicTag>>;
}

/// reqwest-backed [`NapiClient`].
#[derive(Debug, Clone)]
pub struct HttpNapiClient {
    http: HttpClient,
}

impl HttpNapiClient {
    /// Create a client rooted at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new("napi", base_url, timeout)?,
        })
    }
}

/// NAPI addresses NICs by MAC with the colons stripped.
fn mac_path(mac: &str) -> String {
    format!("/nics/{}", mac.replace(':', ""))
}

#[async_trait]
impl NapiClient for HttpNapiClient {
    async fn list_nics(&self, filter: &NicFilter) -> Result<Vec<Nic>> {
        self.http.get_query("/nics", filter).await
    }

    async fn create_nic(&self, request: &CreateNic) -> Result<Nic> {
        self.http.post("/nics", request).await
    }

    async fn delete_nic(&self, mac: &str) -> Result<()> {
        self.http.delete(&mac_path(mac)).await
    }

    async fn get_network(&self, network_uuid: &str) -> Result<Network> {
        self.http.get(&format!("/networks/{}", network_uuid)).await
    }

    async fn get_ip(&self, network_uuid: &str, ip: &str) -> Result<IpEntry> {
        self.http
            .get(&format!("/networks/{}/ips/{}", network_uuid, ip))
            .await
    }

    async fn set_ip_reserved(
        &self,
        network_uuid: &str,
        ip: &str,
        reserved: bool,
    ) -> Result<IpEntry> {
        let path = format!("/networks/{}/ips/{}", network_uuid, ip);
        self.http.put(&path, &json!({ "reserved": reserved })).await
    }

    async fn list_nic_tags(&self) -> Result<Vec<NicTag>> {
        self.http.get("/nic_tags").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_list_nics_by_network() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/nics"))
            .and(query_param("network_uuid", "net-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"mac": "90:b8:d0:00:00:01", "network_uuid": "net-1", "belongs_to_uuid": "vm-1", "ip": "10.0.0.5"},
                {"mac": "90:b8:d0:00:00:02", "network_uuid": "net-1", "belongs_to_uuid": "net-1", "ip": "10.0.0.1"}
            ])))
            .mount(&server)
            .await;

        let napi = HttpNapiClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let nics = napi
            .list_nics(&NicFilter {
                network_uuid: Some("net-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(nics.len(), 2);
        assert_eq!(nics[0].belongs_to_type, "zone");
    }

    #[tokio::test]
    async fn test_set_ip_reserved() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/networks/net-1/ips/10.0.0.5"))
            .and(body_json(json!({"reserved": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ip": "10.0.0.5", "network_uuid": "net-1", "reserved": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let napi = HttpNapiClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let entry = napi.set_ip_reserved("net-1", "10.0.0.5", true).await.unwrap();
        assert!(entry.reserved);
    }

    #[tokio::test]
    async fn test_delete_nic_strips_colons() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/nics/90b8d0000001"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let napi = HttpNapiClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        napi.delete_nic("90:b8:d0:00:00:01").await.unwrap();
    }
}
