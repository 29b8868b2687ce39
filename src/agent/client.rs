//! HTTP client for the device protocol.

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::error::AgentError;
use crate::protocol::{
    CommandOutcome, ConfigSnapshot, ConfirmRequest, ConfirmResponse, FetchConfigRequest,
    HeartbeatRequest, HeartbeatResponse, PollResponse, PolledCommand, PushReadingsRequest,
    PushReadingsResponse, ReadingPayload, DEVICE_ID_HEADER, DEVICE_KEY_HEADER,
};

/// Credentials sent with every call.
#[derive(Debug, Clone)]
pub struct Identity {
    pub composite_id: String,
    pub secret: String,
}

#[async_trait]
pub trait DeviceApi: Send + Sync {
    async fn heartbeat(
        &self,
        identity: &Identity,
        req: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, AgentError>;

    async fn fetch_config(
        &self,
        identity: &Identity,
        req: &FetchConfigRequest,
    ) -> Result<ConfigSnapshot, AgentError>;

    async fn push_readings(
        &self,
        identity: &Identity,
        readings: Vec<ReadingPayload>,
    ) -> Result<usize, AgentError>;

    async fn poll_commands(&self, identity: &Identity) -> Result<Vec<PolledCommand>, AgentError>;

    async fn confirm_command(
        &self,
        identity: &Identity,
        command_id: &str,
        outcome: CommandOutcome,
        error_message: Option<String>,
    ) -> Result<ConfirmResponse, AgentError>;

    async fn confirm_device_command(
        &self,
        identity: &Identity,
        command_id: &str,
        outcome: CommandOutcome,
        error_message: Option<String>,
    ) -> Result<ConfirmResponse, AgentError>;
}

pub struct HttpDeviceApi {
    client: Client,
    base_url: String,
}

impl HttpDeviceApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AgentError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        path: &str,
        identity: &Identity,
        body: &B,
    ) -> Result<T, AgentError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .header(DEVICE_ID_HEADER, &identity.composite_id)
            .header(DEVICE_KEY_HEADER, &identity.secret)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("POST {} failed: {} - {}", path, status, body);
            return Err(AgentError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl DeviceApi for HttpDeviceApi {
    async fn heartbeat(
        &self,
        identity: &Identity,
        req: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, AgentError> {
        self.post("/device/heartbeat", identity, req).await
    }

    async fn fetch_config(
        &self,
        identity: &Identity,
        req: &FetchConfigRequest,
    ) -> Result<ConfigSnapshot, AgentError> {
        self.post("/device/config", identity, req).await
    }

    async fn push_readings(
        &self,
        identity: &Identity,
        readings: Vec<ReadingPayload>,
    ) -> Result<usize, AgentError> {
        let resp: PushReadingsResponse = self
            .post("/device/readings", identity, &PushReadingsRequest { readings })
            .await?;
        Ok(resp.inserted_count)
    }

    async fn poll_commands(&self, identity: &Identity) -> Result<Vec<PolledCommand>, AgentError> {
        let resp: PollResponse = self
            .post("/device/commands/poll", identity, &serde_json::json!({}))
            .await?;
        Ok(resp.commands)
    }

    async fn confirm_command(
        &self,
        identity: &Identity,
        command_id: &str,
        outcome: CommandOutcome,
        error_message: Option<String>,
    ) -> Result<ConfirmResponse, AgentError> {
        let path = format!("/device/commands/{}/confirm", command_id);
        self.post(
            &path,
            identity,
            &ConfirmRequest {
                outcome,
                error_message,
            },
        )
        .await
    }

    async fn confirm_device_command(
        &self,
        identity: &Identity,
        command_id: &str,
        outcome: CommandOutcome,
        error_message: Option<String>,
    ) -> Result<ConfirmResponse, AgentError> {
        let path = format!("/device/device-commands/{}/confirm", command_id);
        self.post(
            &path,
            identity,
            &ConfirmRequest {
                outcome,
                error_message,
            },
        )
        .await
    }
}
