// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compute-node API: agent task dispatch and waitlist tickets.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Value, json};
use std::time::Duration;

use crate::error::Result;
use crate::http::HttpClient;
use crate::types::{AgentTask, AgentTaskHandle, CreateTicket, Ticket, Vm};

/// Compute-node agent and ticket service.
#[async_trait]
pub trait CnapiClient: Send + Sync {
    /// `POST /servers/{server}/vms/{vm}/{action}`
    async fn vm_action(
        &self,
        server_uuid: &str,
        vm_uuid: &str,
        action: &str,
        payload: &Value,
    ) -> Result<AgentTaskHandle>;

    /// `POST /servers/{server}/vms`
    async fn create_vm(&self, server_uuid: &str, payload: &Value) -> Result<AgentTaskHandle>;

    /// `DELETE /servers/{server}/vms/{vm}`
    async fn destroy_vm(&self, server_uuid: &str, vm_uuid: &str) -> Result<AgentTaskHandle>;

    /// `GET /servers/{server}/vms/{vm}`; also returns VMs hidden from inventory.
    async fn load_vm(&self, server_uuid: &str, vm_uuid: &str) -> Result<Vm>;

    /// `GET /tasks/{id}`
    async fn get_task(&self, task_id: &str) -> Result<AgentTask>;

    /// `POST /servers/{server}/tickets`
    async fn create_ticket(&self, server_uuid: &str, request: &CreateTicket) -> Result<Ticket>;

    /// `GET /tickets/{uuid}`
    async fn get_ticket(&self, ticket_uuid: &str) -> Result<Ticket>;

    /// `POST /tickets/{uuid}/wait`; returns the ticket once it is active or
    /// the service gives up waiting.
    async fn wait_ticket(&self, ticket_uuid: &str) -> Result<Ticket>;

    /// `DELETE /tickets/{uuid}`
    async fn release_ticket(&self, ticket_uuid: &str) -> Result<()>;
}

/// reqwest-backed [`CnapiClient`].
#[derive(Debug, Clone)]
pub struct HttpCnapiClient {
    http: HttpClient,
}

impl HttpCnapiClient {
    /// Create a client rooted at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new("cnapi", base_url, timeout)?,
        })
    }
}

#[async_trait]
impl CnapiClient for HttpCnapiClient {
    async fn vm_action(
        &self,
        server_uuid: &str,
        vm_uuid: &str,
        action: &str,
        payload: &Value,
    ) -> Result<AgentTaskHandle> {
        let path = format!("/servers/{}/vms/{}/{}", server_uuid, vm_uuid, action);
        self.http.post(&path, payload).await
    }

    async fn create_vm(&self, server_uuid: &str, payload: &Value) -> Result<AgentTaskHandle> {
        let path = format!("/servers/{}/vms", server_uuid);
        self.http.post(&path, payload).await
    }

    async fn destroy_vm(&self, server_uuid: &str, vm_uuid: &str) -> Result<AgentTaskHandle> {
        let path = format!("/servers/{}/vms/{}", server_uuid, vm_uuid);
        self.http
            .send_json(&path, self.http.request(Method::DELETE, &path))
            .await
    }

    async fn load_vm(&self, server_uuid: &str, vm_uuid: &str) -> Result<Vm> {
        let path = format!("/servers/{}/vms/{}", server_uuid, vm_uuid);
        self.http.get_query(&path, &[("include_dni", "true")]).await
    }

    async fn get_task(&self, task_id: &str) -> Result<AgentTask> {
        self.http.get(&format!("/tasks/{}", task_id)).await
    }

    async fn create_ticket(&self, server_uuid: &str, request: &CreateTicket) -> Result<Ticket> {
        let path = format!("/servers/{}/tickets", server_uuid);
        self.http.post(&path, request).await
    }

    async fn get_ticket(&self, ticket_uuid: &str) -> Result<Ticket> {
        self.http.get(&format!("/tickets/{}", ticket_uuid)).await
    }

    async fn wait_ticket(&self, ticket_uuid: &str) -> Result<Ticket> {
        let path = format!("/tickets/{}/wait", ticket_uuid);
        self.http.post(&path, &json!({})).await
    }

    async fn release_ticket(&self, ticket_uuid: &str) -> Result<()> {
        self.http.delete(&format!("/tickets/{}", ticket_uuid)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::types::{AgentTaskStatus, TicketStatus};
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> HttpCnapiClient {
        HttpCnapiClient::new(server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_vm_action_posts_payload() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/servers/cn-1/vms/vm-1/stop"))
            .and(body_json(json!({"force": true})))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"id": "task-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let handle = client(&server)
            .await
            .vm_action("cn-1", "vm-1", "stop", &json!({"force": true}))
            .await
            .unwrap();
        assert_eq!(handle.id, "task-1");
    }

    #[tokio::test]
    async fn test_get_task_status() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/tasks/task-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "task-1",
                "status": "failure",
                "progress": 100,
                "error": "zone is locked"
            })))
            .mount(&server)
            .await;

        let task = client(&server).await.get_task("task-1").await.unwrap();
        assert_eq!(task.status, AgentTaskStatus::Failure);
        assert_eq!(task.error.as_deref(), Some("zone is locked"));
    }

    #[tokio::test]
    async fn test_load_vm_includes_hidden() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/servers/cn-2/vms/vm-1"))
            .and(query_param("include_dni", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uuid": "vm-1",
                "server_uuid": "cn-2",
                "state": "stopped",
                "do_not_inventory": true
            })))
            .mount(&server)
            .await;

        let vm = client(&server).await.load_vm("cn-2", "vm-1").await.unwrap();
        assert!(vm.do_not_inventory);
    }

    #[tokio::test]
    async fn test_ticket_lifecycle_requests() {
        let server = MockServer::start().await;
        let ticket = json!({
            "uuid": "t-1",
            "server_uuid": "cn-1",
            "scope": "vm",
            "id": "vm-1",
            "status": "queued",
            "expires_at": "2026-01-01T00:00:00Z"
        });

        Mock::given(method("POST"))
            .and(path("/servers/cn-1/tickets"))
            .respond_with(ResponseTemplate::new(202).set_body_json(ticket.clone()))
            .mount(&server)
            .await;
        let mut active = ticket.clone();
        active["status"] = json!("active");
        Mock::given(method("POST"))
            .and(path("/tickets/t-1/wait"))
            .respond_with(ResponseTemplate::new(200).set_body_json(active))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/tickets/t-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let cnapi = client(&server).await;
        let created = cnapi
            .create_ticket(
                "cn-1",
                &CreateTicket {
                    scope: "vm".to_string(),
                    id: "vm-1".to_string(),
                    expires_at: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();
        assert_eq!(created.status, TicketStatus::Queued);

        let waited = cnapi.wait_ticket("t-1").await.unwrap();
        assert_eq!(waited.status, TicketStatus::Active);

        cnapi.release_ticket("t-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_release_unknown_ticket_is_not_found() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/tickets/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .release_ticket("gone")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_server_error_maps_to_http() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/servers/cn-1/vms/vm-1"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .destroy_vm("cn-1", "vm-1")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ClientError::Http {
                service: "cnapi",
                status: 503,
                body: "busy".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let cnapi = HttpCnapiClient::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
        let err = cnapi.get_task("task-1").await.unwrap_err();
        assert_eq!(err.error_code(), "TRANSPORT_ERROR");
    }
}
