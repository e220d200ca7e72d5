//! WiFi backend trait definition

use tokio::sync::broadcast;
use trait_variant::make;

use crate::core::error::WifiResult;
use crate::core::types::{LinkEvent, LinkStatus, NetworkId, WifiCredentials, WifiNetwork};

/// Abstraction over the wireless control interface (typically
/// wpa_supplicant)
///
/// The provisioning session drives the radio exclusively through this
/// trait, which also enables testing with a mock implementation.
#[make(Send)]
pub trait WifiBackend: Sync + 'static {
    /// Scan for available WiFi networks
    ///
    /// Triggers a scan and returns the discovered networks. May take
    /// several seconds.
    async fn scan(&self) -> WifiResult<Vec<WifiNetwork>>;

    /// Register a network configuration without selecting it
    async fn add_network(&self, credentials: &WifiCredentials) -> WifiResult<NetworkId>;

    /// Remove a previously added network configuration
    async fn remove_network(&self, network_id: NetworkId) -> WifiResult<()>;

    /// Select (and enable) a network configuration, initiating association
    async fn select_network(&self, network_id: NetworkId) -> WifiResult<()>;

    /// Disconnect from the current network
    async fn disconnect(&self) -> WifiResult<()>;

    /// Current link status
    async fn status(&self) -> WifiResult<LinkStatus>;

    /// Whether the radio is powered
    async fn radio_enabled(&self) -> WifiResult<bool>;

    /// Power the radio up or down
    async fn set_radio_enabled(&self, enabled: bool) -> WifiResult<()>;

    /// Subscribe to association and authentication events
    ///
    /// Subscribe before initiating a connection to avoid missing the
    /// resolution event.
    fn subscribe(&self) -> broadcast::Receiver<LinkEvent>;
}
