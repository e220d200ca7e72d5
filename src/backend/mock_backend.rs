//! Mock WiFi backend for testing

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::backend::WifiBackend;
use crate::core::error::{WifiError, WifiResult};
use crate::core::types::{LinkEvent, LinkState, LinkStatus, NetworkId, WifiCredentials,
    WifiNetwork};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Internal state for the mock backend
#[derive(Debug)]
struct MockState {
    scan_results: Vec<WifiNetwork>,
    should_fail_scan: bool,
    should_fail_connect: bool,
    auto_associate: bool,
    networks: Vec<(NetworkId, WifiCredentials)>,
    next_network_id: NetworkId,
    status: LinkStatus,
    radio_enabled: bool,
    removed_networks: Vec<NetworkId>,
    selected_networks: Vec<NetworkId>,
    disconnect_count: usize,
}

/// Mock WiFi backend for testing
///
/// Allows configuring behavior for tests without requiring actual
/// hardware. By default, selecting a network immediately emits a matching
/// association event; disable `auto_associate` to drive events by hand.
#[derive(Debug, Clone)]
pub struct MockWifiBackend {
    inner: Arc<Mutex<MockState>>,
    events_tx: broadcast::Sender<LinkEvent>,
}

impl MockWifiBackend {
    /// Create a new mock backend with default state
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(MockState {
                scan_results: vec![],
                should_fail_scan: false,
                should_fail_connect: false,
                auto_associate: true,
                networks: vec![],
                next_network_id: 0,
                status: LinkStatus {
                    state: LinkState::Idle,
                    ssid: None,
                    ip_address: None,
                    network_id: None,
                },
                radio_enabled: true,
                removed_networks: vec![],
                selected_networks: vec![],
                disconnect_count: 0,
            })),
            events_tx,
        }
    }

    /// Configure mock to return specific networks on scan
    pub fn set_scan_results(&self, networks: Vec<WifiNetwork>) {
        self.inner.lock().unwrap().scan_results = networks;
    }

    /// Configure mock to fail scan operations
    pub fn set_scan_failure(&self, should_fail: bool) {
        self.inner.lock().unwrap().should_fail_scan = should_fail;
    }

    /// Configure mock to fail select operations
    pub fn set_connect_failure(&self, should_fail: bool) {
        self.inner.lock().unwrap().should_fail_connect = should_fail;
    }

    /// Disable automatic association events on select
    pub fn set_auto_associate(&self, auto: bool) {
        self.inner.lock().unwrap().auto_associate = auto;
    }

    /// Pre-set the reported link status
    pub fn set_status(&self, status: LinkStatus) {
        self.inner.lock().unwrap().status = status;
    }

    /// Emit a raw link event to all subscribers
    pub fn emit(&self, event: LinkEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Network ids removed so far
    pub fn removed_networks(&self) -> Vec<NetworkId> {
        self.inner.lock().unwrap().removed_networks.clone()
    }

    /// Network ids selected so far, in order
    pub fn selected_networks(&self) -> Vec<NetworkId> {
        self.inner.lock().unwrap().selected_networks.clone()
    }

    /// Number of disconnect calls
    pub fn disconnect_count(&self) -> usize {
        self.inner.lock().unwrap().disconnect_count
    }

    /// Credentials of a registered network configuration
    pub fn network_credentials(&self, network_id: NetworkId) -> Option<WifiCredentials> {
        self.inner
            .lock()
            .unwrap()
            .networks
            .iter()
            .find(|(id, _)| *id == network_id)
            .map(|(_, c)| c.clone())
    }
}

impl Default for MockWifiBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl WifiBackend for MockWifiBackend {
    async fn scan(&self) -> WifiResult<Vec<WifiNetwork>> {
        let state = self.inner.lock().unwrap();
        if state.should_fail_scan {
            Err(WifiError::ScanFailed("Mock scan failure".into()))
        } else {
            Ok(state.scan_results.clone())
        }
    }

    async fn add_network(&self, credentials: &WifiCredentials) -> WifiResult<NetworkId> {
        let mut state = self.inner.lock().unwrap();
        let network_id = state.next_network_id;
        state.next_network_id += 1;
        state.networks.push((network_id, credentials.clone()));
        Ok(network_id)
    }

    async fn remove_network(&self, network_id: NetworkId) -> WifiResult<()> {
        let mut state = self.inner.lock().unwrap();
        state.networks.retain(|(id, _)| *id != network_id);
        state.removed_networks.push(network_id);
        Ok(())
    }

    async fn select_network(&self, network_id: NetworkId) -> WifiResult<()> {
        let event = {
            let mut state = self.inner.lock().unwrap();
            if state.should_fail_connect {
                return Err(WifiError::ConnectionFailed("Mock connect failure".into()));
            }

            state.selected_networks.push(network_id);
            let ssid = state
                .networks
                .iter()
                .find(|(id, _)| *id == network_id)
                .map(|(_, c)| c.ssid.clone())
                .unwrap_or_default();

            let address = Ipv4Addr::new(192, 168, 10, 2);
            state.status = LinkStatus {
                state: LinkState::Connected,
                ssid: Some(ssid.clone()),
                ip_address: Some(address),
                network_id: Some(network_id),
            };

            state.auto_associate.then_some(LinkEvent::Associated {
                ssid,
                address: Some(address),
            })
        };

        if let Some(event) = event {
            let _ = self.events_tx.send(event);
        }
        Ok(())
    }

    async fn disconnect(&self) -> WifiResult<()> {
        let mut state = self.inner.lock().unwrap();
        state.disconnect_count += 1;
        state.status = LinkStatus {
            state: LinkState::Idle,
            ssid: None,
            ip_address: None,
            network_id: None,
        };
        Ok(())
    }

    async fn status(&self) -> WifiResult<LinkStatus> {
        Ok(self.inner.lock().unwrap().status.clone())
    }

    async fn radio_enabled(&self) -> WifiResult<bool> {
        Ok(self.inner.lock().unwrap().radio_enabled)
    }

    async fn set_radio_enabled(&self, enabled: bool) -> WifiResult<()> {
        self.inner.lock().unwrap().radio_enabled = enabled;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events_tx.subscribe()
    }
}
