//! Device-local HTTP API client
//!
//! The device serves a small HTTP API on whichever network it currently
//! sits on; the base endpoint therefore changes across the handoff and is
//! passed explicitly per call rather than held as client state.

use std::time::Duration;

use tracing::debug;
use trait_variant::make;

use crate::{
    core::{
        error::{TransportError, TransportResult},
        types::DeviceEndpoint,
    },
    protocol::{ClientTokenResponse, ProbeInfo, SignalMessage},
};

/// Abstraction over the device-local HTTP API
#[make(Send)]
pub trait DeviceTransport: Sync + 'static {
    /// `POST /keys`: obtain a client token from the device
    async fn post_keys(&self, endpoint: &DeviceEndpoint) -> TransportResult<String>;

    /// `POST /wifi`: transmit the encoded credential string
    async fn post_wifi(&self, endpoint: &DeviceEndpoint, credential: &str)
    -> TransportResult<()>;

    /// `GET /messages`: read the most recently learned signal, if any
    async fn get_messages(
        &self,
        endpoint: &DeviceEndpoint,
    ) -> TransportResult<Option<SignalMessage>>;

    /// `POST /messages`: transmit a signal through the device
    async fn post_messages(
        &self,
        endpoint: &DeviceEndpoint,
        message: &SignalMessage,
    ) -> TransportResult<()>;

    /// `GET /`: connectivity probe
    async fn probe(&self, endpoint: &DeviceEndpoint) -> TransportResult<ProbeInfo>;
}

/// reqwest-backed device API client
pub struct HttpDeviceClient {
    client: reqwest::Client,
}

impl HttpDeviceClient {
    /// Create a client with the given per-request timeout
    pub fn new(timeout: Duration) -> TransportResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Distinguish the peer dropping the connection from other failures;
    /// mid-handoff the device leaves the network instead of answering
    fn map_send_error(error: reqwest::Error) -> TransportError {
        if error.is_connect() || (error.is_request() && !error.is_timeout()) {
            TransportError::ConnectionReset(error.to_string())
        } else {
            TransportError::Http(error)
        }
    }

    fn check_status(response: &reqwest::Response) -> TransportResult<()> {
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(())
    }
}

impl DeviceTransport for HttpDeviceClient {
    async fn post_keys(&self, endpoint: &DeviceEndpoint) -> TransportResult<String> {
        debug!("POST /keys on {}", endpoint.base_url());

        let response = self
            .client
            .post(format!("{}/keys", endpoint.base_url()))
            .send()
            .await?;
        Self::check_status(&response)?;

        let body: ClientTokenResponse = response.json().await?;
        Ok(body.clienttoken)
    }

    async fn post_wifi(
        &self,
        endpoint: &DeviceEndpoint,
        credential: &str,
    ) -> TransportResult<()> {
        debug!("POST /wifi on {}", endpoint.base_url());

        let response = self
            .client
            .post(format!("{}/wifi", endpoint.base_url()))
            .body(credential.to_string())
            .send()
            .await
            .map_err(Self::map_send_error)?;
        Self::check_status(&response)?;
        Ok(())
    }

    async fn get_messages(
        &self,
        endpoint: &DeviceEndpoint,
    ) -> TransportResult<Option<SignalMessage>> {
        debug!("GET /messages on {}", endpoint.base_url());

        let response = self
            .client
            .get(format!("{}/messages", endpoint.base_url()))
            .send()
            .await?;
        Self::check_status(&response)?;

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }

        let message = serde_json::from_str(&body)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        Ok(Some(message))
    }

    async fn post_messages(
        &self,
        endpoint: &DeviceEndpoint,
        message: &SignalMessage,
    ) -> TransportResult<()> {
        debug!("POST /messages on {}", endpoint.base_url());

        let response = self
            .client
            .post(format!("{}/messages", endpoint.base_url()))
            .json(message)
            .send()
            .await?;
        Self::check_status(&response)?;
        Ok(())
    }

    async fn probe(&self, endpoint: &DeviceEndpoint) -> TransportResult<ProbeInfo> {
        debug!("GET / on {}", endpoint.base_url());

        let response = self.client.get(endpoint.base_url()).send().await?;
        Self::check_status(&response)?;

        let server = response
            .headers()
            .get(reqwest::header::SERVER)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        Ok(ProbeInfo { server })
    }
}
