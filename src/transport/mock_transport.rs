//! Mock HTTP transports for testing
//!
//! Both mocks answer with sensible defaults and let tests push scripted
//! results per endpoint, inject a response delay, and inspect recorded
//! calls. Delivery concurrency is tracked so queue tests can assert the
//! single-flight invariant.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{
    core::{
        error::TransportResult,
        types::DeviceEndpoint,
    },
    protocol::{DevicesResponse, DoorResponse, KeysResponse, ProbeInfo, RelayInbox,
        SignalMessage},
    transport::{device::DeviceTransport, relay::RelayTransport},
};

#[derive(Default)]
struct MockDeviceState {
    response_delay: Option<Duration>,
    keys_results: VecDeque<TransportResult<String>>,
    wifi_results: VecDeque<TransportResult<()>>,
    get_messages_results: VecDeque<TransportResult<Option<SignalMessage>>>,
    post_messages_results: VecDeque<TransportResult<()>>,
    probe_results: VecDeque<TransportResult<ProbeInfo>>,
    keys_calls: usize,
    wifi_calls: Vec<String>,
    get_messages_calls: usize,
    post_messages_calls: Vec<(DeviceEndpoint, SignalMessage)>,
    probe_calls: usize,
    inflight: usize,
    max_inflight: usize,
}

/// Mock device-local API for testing
#[derive(Clone, Default)]
pub struct MockDeviceTransport {
    inner: Arc<Mutex<MockDeviceState>>,
}

impl MockDeviceTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response by `delay`; combined with a paused clock this
    /// exercises caller-side timeouts
    pub fn set_response_delay(&self, delay: Option<Duration>) {
        self.inner.lock().unwrap().response_delay = delay;
    }

    pub fn push_keys_result(&self, result: TransportResult<String>) {
        self.inner.lock().unwrap().keys_results.push_back(result);
    }

    pub fn push_wifi_result(&self, result: TransportResult<()>) {
        self.inner.lock().unwrap().wifi_results.push_back(result);
    }

    pub fn push_get_messages_result(&self, result: TransportResult<Option<SignalMessage>>) {
        self.inner
            .lock()
            .unwrap()
            .get_messages_results
            .push_back(result);
    }

    pub fn push_post_messages_result(&self, result: TransportResult<()>) {
        self.inner
            .lock()
            .unwrap()
            .post_messages_results
            .push_back(result);
    }

    pub fn push_probe_result(&self, result: TransportResult<ProbeInfo>) {
        self.inner.lock().unwrap().probe_results.push_back(result);
    }

    pub fn keys_calls(&self) -> usize {
        self.inner.lock().unwrap().keys_calls
    }

    /// Credential strings received on `/wifi`, in order
    pub fn wifi_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().wifi_calls.clone()
    }

    pub fn get_messages_calls(&self) -> usize {
        self.inner.lock().unwrap().get_messages_calls
    }

    pub fn post_messages_calls(&self) -> Vec<(DeviceEndpoint, SignalMessage)> {
        self.inner.lock().unwrap().post_messages_calls.clone()
    }

    pub fn probe_calls(&self) -> usize {
        self.inner.lock().unwrap().probe_calls
    }

    /// Highest number of concurrently outstanding requests observed
    pub fn max_inflight(&self) -> usize {
        self.inner.lock().unwrap().max_inflight
    }

    async fn enter(&self) -> Option<Duration> {
        let mut state = self.inner.lock().unwrap();
        state.inflight += 1;
        state.max_inflight = state.max_inflight.max(state.inflight);
        state.response_delay
    }

    async fn leave(&self) {
        self.inner.lock().unwrap().inflight -= 1;
    }

    async fn delay(&self, delay: Option<Duration>) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl DeviceTransport for MockDeviceTransport {
    async fn post_keys(&self, _endpoint: &DeviceEndpoint) -> TransportResult<String> {
        let delay = self.enter().await;
        self.inner.lock().unwrap().keys_calls += 1;
        self.delay(delay).await;
        self.leave().await;

        let scripted = self.inner.lock().unwrap().keys_results.pop_front();
        scripted.unwrap_or_else(|| Ok("mock-client-token".to_string()))
    }

    async fn post_wifi(
        &self,
        _endpoint: &DeviceEndpoint,
        credential: &str,
    ) -> TransportResult<()> {
        let delay = self.enter().await;
        self.inner
            .lock()
            .unwrap()
            .wifi_calls
            .push(credential.to_string());
        self.delay(delay).await;
        self.leave().await;

        let scripted = self.inner.lock().unwrap().wifi_results.pop_front();
        scripted.unwrap_or(Ok(()))
    }

    async fn get_messages(
        &self,
        _endpoint: &DeviceEndpoint,
    ) -> TransportResult<Option<SignalMessage>> {
        let delay = self.enter().await;
        self.inner.lock().unwrap().get_messages_calls += 1;
        self.delay(delay).await;
        self.leave().await;

        let scripted = self.inner.lock().unwrap().get_messages_results.pop_front();
        scripted.unwrap_or(Ok(None))
    }

    async fn post_messages(
        &self,
        endpoint: &DeviceEndpoint,
        message: &SignalMessage,
    ) -> TransportResult<()> {
        let delay = self.enter().await;
        self.inner
            .lock()
            .unwrap()
            .post_messages_calls
            .push((*endpoint, message.clone()));
        self.delay(delay).await;
        self.leave().await;

        let scripted = self.inner.lock().unwrap().post_messages_results.pop_front();
        scripted.unwrap_or(Ok(()))
    }

    async fn probe(&self, _endpoint: &DeviceEndpoint) -> TransportResult<ProbeInfo> {
        let delay = self.enter().await;
        self.inner.lock().unwrap().probe_calls += 1;
        self.delay(delay).await;
        self.leave().await;

        let scripted = self.inner.lock().unwrap().probe_results.pop_front();
        scripted.unwrap_or_else(|| {
            Ok(ProbeInfo {
                server: Some("IRKit/3.0.0.0".to_string()),
            })
        })
    }
}

#[derive(Default)]
struct MockRelayState {
    response_delay: Option<Duration>,
    client_key_results: VecDeque<TransportResult<String>>,
    register_results: VecDeque<TransportResult<KeysResponse>>,
    device_key_results: VecDeque<TransportResult<DevicesResponse>>,
    door_results: VecDeque<TransportResult<DoorResponse>>,
    inbox_results: VecDeque<TransportResult<Option<RelayInbox>>>,
    post_messages_results: VecDeque<TransportResult<()>>,
    client_key_calls: usize,
    register_calls: Vec<(String, String)>,
    device_key_calls: usize,
    door_calls: usize,
    inbox_clear_flags: Vec<bool>,
    post_messages_calls: Vec<(String, SignalMessage)>,
    inflight: usize,
    max_inflight: usize,
}

/// Mock cloud relay API for testing
#[derive(Clone, Default)]
pub struct MockRelayTransport {
    inner: Arc<Mutex<MockRelayState>>,
}

impl MockRelayTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_response_delay(&self, delay: Option<Duration>) {
        self.inner.lock().unwrap().response_delay = delay;
    }

    pub fn push_client_key_result(&self, result: TransportResult<String>) {
        self.inner
            .lock()
            .unwrap()
            .client_key_results
            .push_back(result);
    }

    pub fn push_register_result(&self, result: TransportResult<KeysResponse>) {
        self.inner.lock().unwrap().register_results.push_back(result);
    }

    pub fn push_device_key_result(&self, result: TransportResult<DevicesResponse>) {
        self.inner
            .lock()
            .unwrap()
            .device_key_results
            .push_back(result);
    }

    pub fn push_door_result(&self, result: TransportResult<DoorResponse>) {
        self.inner.lock().unwrap().door_results.push_back(result);
    }

    pub fn push_inbox_result(&self, result: TransportResult<Option<RelayInbox>>) {
        self.inner.lock().unwrap().inbox_results.push_back(result);
    }

    pub fn push_post_messages_result(&self, result: TransportResult<()>) {
        self.inner
            .lock()
            .unwrap()
            .post_messages_results
            .push_back(result);
    }

    pub fn client_key_calls(&self) -> usize {
        self.inner.lock().unwrap().client_key_calls
    }

    /// (clienttoken, clientkey) pairs seen on `/1/keys`
    pub fn register_calls(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().register_calls.clone()
    }

    pub fn device_key_calls(&self) -> usize {
        self.inner.lock().unwrap().device_key_calls
    }

    pub fn door_calls(&self) -> usize {
        self.inner.lock().unwrap().door_calls
    }

    /// `clear` flags seen on `/1/messages`, in order
    pub fn inbox_clear_flags(&self) -> Vec<bool> {
        self.inner.lock().unwrap().inbox_clear_flags.clone()
    }

    /// (deviceid, message) pairs seen on `/1/messages`
    pub fn post_messages_calls(&self) -> Vec<(String, SignalMessage)> {
        self.inner.lock().unwrap().post_messages_calls.clone()
    }

    /// Highest number of concurrently outstanding requests observed
    pub fn max_inflight(&self) -> usize {
        self.inner.lock().unwrap().max_inflight
    }

    async fn enter(&self) -> Option<Duration> {
        let mut state = self.inner.lock().unwrap();
        state.inflight += 1;
        state.max_inflight = state.max_inflight.max(state.inflight);
        state.response_delay
    }

    async fn leave(&self) {
        self.inner.lock().unwrap().inflight -= 1;
    }

    async fn delay(&self, delay: Option<Duration>) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl RelayTransport for MockRelayTransport {
    async fn obtain_client_key(&self, _api_key: &str) -> TransportResult<String> {
        let delay = self.enter().await;
        self.inner.lock().unwrap().client_key_calls += 1;
        self.delay(delay).await;
        self.leave().await;

        let scripted = self.inner.lock().unwrap().client_key_results.pop_front();
        scripted.unwrap_or_else(|| Ok("mock-clientkey".to_string()))
    }

    async fn register_client(
        &self,
        client_token: &str,
        client_key: &str,
    ) -> TransportResult<KeysResponse> {
        let delay = self.enter().await;
        self.inner
            .lock()
            .unwrap()
            .register_calls
            .push((client_token.to_string(), client_key.to_string()));
        self.delay(delay).await;
        self.leave().await;

        let scripted = self.inner.lock().unwrap().register_results.pop_front();
        scripted.unwrap_or_else(|| {
            Ok(KeysResponse {
                deviceid: "mock-device".to_string(),
                clientkey: client_key.to_string(),
            })
        })
    }

    async fn obtain_device_key(&self, _client_key: &str) -> TransportResult<DevicesResponse> {
        let delay = self.enter().await;
        self.inner.lock().unwrap().device_key_calls += 1;
        self.delay(delay).await;
        self.leave().await;

        let scripted = self.inner.lock().unwrap().device_key_results.pop_front();
        scripted.unwrap_or_else(|| {
            Ok(DevicesResponse {
                devicekey: "mock-devicekey".to_string(),
                deviceid: "mock-device".to_string(),
            })
        })
    }

    async fn door(&self, _client_key: &str, _device_id: &str) -> TransportResult<DoorResponse> {
        let delay = self.enter().await;
        self.inner.lock().unwrap().door_calls += 1;
        self.delay(delay).await;
        self.leave().await;

        let scripted = self.inner.lock().unwrap().door_results.pop_front();
        scripted.unwrap_or_else(|| {
            Ok(DoorResponse {
                hostname: Some("mock-host".to_string()),
            })
        })
    }

    async fn get_messages(
        &self,
        _client_key: &str,
        clear: bool,
    ) -> TransportResult<Option<RelayInbox>> {
        let delay = self.enter().await;
        self.inner.lock().unwrap().inbox_clear_flags.push(clear);
        self.delay(delay).await;
        self.leave().await;

        let scripted = self.inner.lock().unwrap().inbox_results.pop_front();
        scripted.unwrap_or(Ok(None))
    }

    async fn post_messages(
        &self,
        _client_key: &str,
        device_id: &str,
        message: &SignalMessage,
    ) -> TransportResult<()> {
        let delay = self.enter().await;
        self.inner
            .lock()
            .unwrap()
            .post_messages_calls
            .push((device_id.to_string(), message.clone()));
        self.delay(delay).await;
        self.leave().await;

        let scripted = self.inner.lock().unwrap().post_messages_results.pop_front();
        scripted.unwrap_or(Ok(()))
    }
}
