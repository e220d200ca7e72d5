//! Cloud relay HTTP API client
//!
//! The relay stores commands for pickup by devices that are not locally
//! reachable and confirms device-reported connectivity. Its door and
//! inbox endpoints are long-polls with transparent-retry semantics; the
//! retry loops live in the helpers below so both the real client and the
//! mock share them.

use std::time::Duration;

use tracing::debug;
use trait_variant::make;

use crate::{
    core::error::{TransportError, TransportResult},
    protocol::{ClientsResponse, DevicesResponse, DoorResponse, KeysResponse, RelayInbox,
        SignalMessage},
};

/// Budget for a single long-poll request, longer than the base timeout
const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(25);

/// Abstraction over the cloud relay HTTP API
#[make(Send)]
pub trait RelayTransport: Sync + 'static {
    /// `POST /1/clients`: exchange the API key for a client key
    async fn obtain_client_key(&self, api_key: &str) -> TransportResult<String>;

    /// `POST /1/keys`: register a device-issued client token, learning the
    /// device id it belongs to
    async fn register_client(
        &self,
        client_token: &str,
        client_key: &str,
    ) -> TransportResult<KeysResponse>;

    /// `POST /1/devices`: obtain a fresh device key and device id
    async fn obtain_device_key(&self, client_key: &str) -> TransportResult<DevicesResponse>;

    /// `POST /1/door`: one long-poll attempt for the device's first
    /// post-handoff report; see [`wait_for_door`] for the retry loop
    async fn door(&self, client_key: &str, device_id: &str) -> TransportResult<DoorResponse>;

    /// `GET /1/messages`: one long-poll attempt for the newest learned
    /// signal; see [`fetch_inbox`] for the retry loop
    async fn get_messages(
        &self,
        client_key: &str,
        clear: bool,
    ) -> TransportResult<Option<RelayInbox>>;

    /// `POST /1/messages`: store a signal for relayed delivery
    async fn post_messages(
        &self,
        client_key: &str,
        device_id: &str,
        message: &SignalMessage,
    ) -> TransportResult<()>;
}

/// Long-poll the door until the device reports in
///
/// 4xx-class responses and empty confirmations mean "poll again", not
/// failure; anything else propagates. The caller bounds the loop with its
/// phase timeout.
pub async fn wait_for_door<R: RelayTransport>(
    relay: &R,
    client_key: &str,
    device_id: &str,
) -> TransportResult<String> {
    let mut attempts: u32 = 0;
    loop {
        match relay.door(client_key, device_id).await {
            Ok(DoorResponse {
                hostname: Some(hostname),
            }) if !hostname.is_empty() => {
                debug!("Door confirmed after {} retries: {}", attempts, hostname);
                return Ok(hostname);
            }
            Ok(_) | Err(TransportError::EmptyBody) => {}
            Err(TransportError::Status(code)) if (400..500).contains(&code) => {}
            Err(other) => return Err(other),
        }
        attempts += 1;
    }
}

/// Long-poll the relay inbox until a signal arrives
///
/// The first attempt clears the inbox cursor; empty responses retry
/// without `clear` so nothing is skipped.
pub async fn fetch_inbox<R: RelayTransport>(
    relay: &R,
    client_key: &str,
) -> TransportResult<RelayInbox> {
    let mut clear = true;
    loop {
        match relay.get_messages(client_key, clear).await {
            Ok(Some(inbox)) => return Ok(inbox),
            Ok(None) | Err(TransportError::EmptyBody) => clear = false,
            Err(other) => return Err(other),
        }
    }
}

/// reqwest-backed relay API client
pub struct HttpRelayClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRelayClient {
    /// Create a client for the given relay base URL
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> TransportResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn check_status(response: &reqwest::Response) -> TransportResult<()> {
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(())
    }
}

impl RelayTransport for HttpRelayClient {
    async fn obtain_client_key(&self, api_key: &str) -> TransportResult<String> {
        debug!("POST /1/clients");

        let response = self
            .client
            .post(self.url("/1/clients"))
            .form(&[("apikey", api_key)])
            .send()
            .await?;
        Self::check_status(&response)?;

        let body: ClientsResponse = response.json().await?;
        Ok(body.clientkey)
    }

    async fn register_client(
        &self,
        client_token: &str,
        client_key: &str,
    ) -> TransportResult<KeysResponse> {
        debug!("POST /1/keys");

        let response = self
            .client
            .post(self.url("/1/keys"))
            .form(&[("clienttoken", client_token), ("clientkey", client_key)])
            .send()
            .await?;
        Self::check_status(&response)?;

        Ok(response.json().await?)
    }

    async fn obtain_device_key(&self, client_key: &str) -> TransportResult<DevicesResponse> {
        debug!("POST /1/devices");

        let response = self
            .client
            .post(self.url("/1/devices"))
            .form(&[("clientkey", client_key)])
            .send()
            .await?;
        Self::check_status(&response)?;

        Ok(response.json().await?)
    }

    async fn door(&self, client_key: &str, device_id: &str) -> TransportResult<DoorResponse> {
        debug!("POST /1/door");

        let response = self
            .client
            .post(self.url("/1/door"))
            .timeout(LONG_POLL_TIMEOUT)
            .form(&[("clientkey", client_key), ("deviceid", device_id)])
            .send()
            .await?;
        Self::check_status(&response)?;

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Err(TransportError::EmptyBody);
        }

        serde_json::from_str(&body).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    async fn get_messages(
        &self,
        client_key: &str,
        clear: bool,
    ) -> TransportResult<Option<RelayInbox>> {
        debug!("GET /1/messages (clear: {})", clear);

        let mut request = self
            .client
            .get(self.url("/1/messages"))
            .timeout(LONG_POLL_TIMEOUT)
            .query(&[("clientkey", client_key)]);
        if clear {
            request = request.query(&[("clear", "1")]);
        }

        let response = request.send().await?;
        Self::check_status(&response)?;

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }

        let inbox = serde_json::from_str(&body)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        Ok(Some(inbox))
    }

    async fn post_messages(
        &self,
        client_key: &str,
        device_id: &str,
        message: &SignalMessage,
    ) -> TransportResult<()> {
        debug!("POST /1/messages for device {}", device_id);

        let message_json = serde_json::to_string(message)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;

        let response = self
            .client
            .post(self.url("/1/messages"))
            .form(&[
                ("clientkey", client_key),
                ("deviceid", device_id),
                ("message", message_json.as_str()),
            ])
            .send()
            .await?;
        Self::check_status(&response)?;
        Ok(())
    }
}
