// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Thin JSON-over-HTTP helper shared by the service adapters.
//!
//! One request per call. Status codes map onto [`ClientError`]:
//! 404 → `NotFound`, 409 → `Conflict`, any other non-2xx → `Http`.

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use crate::error::{ClientError, Result};

/// A base URL plus a configured reqwest client.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
    service: &'static str,
}

impl HttpClient {
    /// Create a client for `service` rooted at `base_url`.
    pub fn new(service: &'static str, base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Transport {
                service,
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service,
        })
    }

    /// Service name used in errors.
    pub fn service(&self) -> &'static str {
        self.service
    }

    /// Base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Start a request for `path` (which must begin with `/`).
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
    }

    /// `GET path` and decode the JSON response.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json(path, self.request(Method::GET, path)).await
    }

    /// `GET path?query` and decode the JSON response.
    pub async fn get_query<Q: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        query: &Q,
    ) -> Result<T> {
        self.send_json(path, self.request(Method::GET, path).query(query))
            .await
    }

    /// `POST path` with a JSON body and decode the JSON response.
    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.send_json(path, self.request(Method::POST, path).json(body))
            .await
    }

    /// `PUT path` with a JSON body and decode the JSON response.
    pub async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.send_json(path, self.request(Method::PUT, path).json(body))
            .await
    }

    /// `DELETE path`, ignoring any response body.
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.send(path, self.request(Method::DELETE, path)).await?;
        Ok(())
    }

    /// Send a prepared request and decode its JSON response.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        path: &str,
        request: RequestBuilder,
    ) -> Result<T> {
        let response = self.send(path, request).await?;
        response.json().await.map_err(|e| ClientError::Decode {
            service: self.service,
            message: e.to_string(),
        })
    }

    /// Send a prepared request, mapping transport failures and error statuses.
    pub async fn send(&self, path: &str, request: RequestBuilder) -> Result<Response> {
        debug!(service = self.service, path = %path, "Sending request");

        let response = request.send().await.map_err(|e| ClientError::Transport {
            service: self.service,
            message: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => ClientError::NotFound {
                service: self.service,
                resource: path.to_string(),
            },
            StatusCode::CONFLICT => ClientError::Conflict {
                service: self.service,
                message: body,
            },
            _ => ClientError::Http {
                service: self.service,
                status: status.as_u16(),
                body,
            },
        })
    }
}
