// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job service.

use async_trait::async_trait;
use reqwest::Method;
use std::time::Duration;

use crate::error::Result;
use crate::http::HttpClient;

/// Job service, used to cancel jobs driving other workflows.
#[async_trait]
pub trait JobsClient: Send + Sync {
    /// `POST /jobs/{uuid}/cancel`
    async fn cancel_job(&self, job_uuid: &str) -> Result<()>;
}

/// reqwest-backed [`JobsClient`].
#[derive(Debug, Clone)]
pub struct HttpJobsClient {
    http: HttpClient,
}

impl HttpJobsClient {
    /// Create a client rooted at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new("jobs", base_url, timeout)?,
        })
    }
}

#[async_trait]
impl JobsClient for HttpJobsClient {
    async fn cancel_job(&self, job_uuid: &str) -> Result<()> {
        let path = format!("/jobs/{}/cancel", job_uuid);
        self.http
            .send(&path, self.http.request(Method::POST, &path))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_cancel_job() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/jobs/job-1/cancel"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let jobs = HttpJobsClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        jobs.cancel_job("job-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_finished_job_reports_status() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/jobs/job-2/cancel"))
            .respond_with(ResponseTemplate::new(422).set_body_string("job already finished"))
            .mount(&server)
            .await;

        let jobs = HttpJobsClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = jobs.cancel_job("job-2").await.unwrap_err();
        assert_eq!(err.error_code(), "HTTP_ERROR");
    }
}
