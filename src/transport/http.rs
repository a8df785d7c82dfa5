//! HTTP control client
//!
//! Sends start/interrupt/resume/cancel requests to the workflow server as
//! JSON POSTs:
//!
//! | Request   | Route                                  |
//! |-----------|----------------------------------------|
//! | start     | `POST /api/executions`                 |
//! | interrupt | `POST /api/executions/{id}/interrupt`  |
//! | resume    | `POST /api/executions/{id}/resume`     |
//! | cancel    | `POST /api/executions/{id}/cancel`     |
//!
//! When a client id is set it travels in the `X-Client-Id` header so the
//! server can attribute the resulting stream events to this session.

use async_trait::async_trait;
use reqwest::{header, Client as HttpClient};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, error};
use url::Url;

use super::ControlTransport;
use crate::config::TrackerConfig;
use crate::models::{
    CancelRequest, ControlAck, InterruptRequest, ResumeRequest, StartExecutionRequest,
    StartExecutionResponse,
};
use crate::{Result, TrackerError};

/// `ControlTransport` backed by `reqwest`
#[derive(Debug, Clone)]
pub struct HttpControlClient {
    http_client: HttpClient,
    base_url: Url,
    client_id: Option<String>,
}

const CLIENT_ID_HEADER: &str = "X-Client-Id";

impl HttpControlClient {
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self> {
        let base_url = Url::parse(base_url)?;

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_static(concat!(
                "execution-tracker/",
                env!("CARGO_PKG_VERSION")
            )),
        );

        let http_client = HttpClient::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .default_headers(headers)
            .build()
            .map_err(|e| TrackerError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http_client,
            base_url,
            client_id: None,
        })
    }

    /// Tag every request with the session's correlation id
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn from_config(config: &TrackerConfig) -> Result<Self> {
        Self::new(&config.server_url, config.request_timeout_ms)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build `{base}/api/executions/{segments...}` with each segment escaped
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TrackerError::Configuration {
                message: format!("Server URL cannot be a base: {}", self.base_url),
            })?
            .pop_if_empty()
            .extend(["api", "executions"])
            .extend(segments);
        Ok(url)
    }

    /// POST a JSON body, turning non-2xx statuses into transport errors
    async fn send<B: Serialize>(&self, url: &Url, body: &B) -> Result<reqwest::Response> {
        debug!("POST {}", url);
        let mut request = self.http_client.post(url.clone()).json(body);
        if let Some(client_id) = &self.client_id {
            request = request.header(CLIENT_ID_HEADER, client_id);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!("Control request to {} failed with {}: {}", url, status, text);
            return Err(TrackerError::transport(format!(
                "Server returned {}: {}",
                status.as_u16(),
                text
            )));
        }
        Ok(response)
    }

    async fn post<B, T>(&self, url: Url, body: &B) -> Result<T>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let response = self.send(&url, body).await?;
        response.json().await.map_err(|e| {
            TrackerError::transport(format!("Failed to parse response from {}: {}", url, e))
        })
    }

    /// POST a resume/cancel body and check the acknowledgment
    async fn post_acknowledged<B: Serialize>(&self, url: Url, body: &B) -> Result<()> {
        let ack: ControlAck = self.post(url, body).await?;
        if ack.success {
            Ok(())
        } else {
            Err(TrackerError::transport(
                ack.message
                    .unwrap_or_else(|| "Server rejected the request".to_string()),
            ))
        }
    }
}

#[async_trait]
impl ControlTransport for HttpControlClient {
    async fn start_execution(&self, request: StartExecutionRequest) -> Result<StartExecutionResponse> {
        let url = self.endpoint(&[])?;
        self.post(url, &request).await
    }

    async fn interrupt(&self, request: InterruptRequest) -> Result<()> {
        let url = self.endpoint(&[&request.execution_id, "interrupt"])?;
        self.send(&url, &request).await?;
        Ok(())
    }

    async fn resume(&self, request: ResumeRequest) -> Result<()> {
        let url = self.endpoint(&[&request.execution_id, "resume"])?;
        self.post_acknowledged(url, &request).await
    }

    async fn cancel(&self, request: CancelRequest) -> Result<()> {
        let url = self.endpoint(&[&request.execution_id, "cancel"])?;
        self.post_acknowledged(url, &request).await
    }
}
