//! wifi-ctrl backend implementation

use std::net::Ipv4Addr;

use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use wifi_ctrl::sta::{Broadcast, BroadcastReceiver, RequestClient, WifiSetup};

use crate::{
    backend::WifiBackend,
    core::{
        error::{WifiError, WifiResult},
        types::{LinkEvent, LinkState, LinkStatus, NetworkId, SecurityMode, WifiCredentials,
            WifiNetwork},
    },
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct WifiCtrlBackend {
    interface: String,
    client: RequestClient,
    events_tx: broadcast::Sender<LinkEvent>,
}

impl WifiCtrlBackend {
    pub async fn new(interface: String) -> WifiResult<Self> {
        let path = format!("/var/run/wpa_supplicant/{}", interface);
        let mut setup =
            WifiSetup::new().map_err(|e| WifiError::WpaSupplicantError(e.to_string()))?;
        setup.set_socket_path(path);

        let client = setup.get_request_client();
        let broadcast_receiver = setup.get_broadcast_receiver();
        let station = setup.complete();

        // Spawn the station runtime
        tokio::spawn(async move {
            if let Err(e) = station.run().await {
                error!("WifiStation runtime error: {}", e);
            }
        });

        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(Self::pump_events(
            broadcast_receiver,
            client.clone(),
            events_tx.clone(),
        ));

        Ok(Self {
            interface,
            client,
            events_tx,
        })
    }

    /// Translate wpa_supplicant broadcasts into link events
    async fn pump_events(
        mut receiver: BroadcastReceiver,
        client: RequestClient,
        events_tx: broadcast::Sender<LinkEvent>,
    ) {
        loop {
            match receiver.recv().await {
                Ok(Broadcast::Connected) => {
                    let status = client.get_status().await.ok();
                    let ssid = status
                        .as_ref()
                        .and_then(|s| s.get("ssid").cloned())
                        .unwrap_or_default();
                    let address = status
                        .as_ref()
                        .and_then(|s| s.get("ip_address"))
                        .and_then(|ip| ip.parse().ok());
                    let _ = events_tx.send(LinkEvent::Associated { ssid, address });
                }
                Ok(Broadcast::WrongPsk) => {
                    let status = client.get_status().await.ok();
                    let ssid = status
                        .as_ref()
                        .and_then(|s| s.get("ssid").cloned())
                        .unwrap_or_default();
                    let _ = events_tx.send(LinkEvent::AuthenticationFailed { ssid });
                }
                Ok(Broadcast::Disconnected) => {
                    let _ = events_tx.send(LinkEvent::Disassociated { ssid: None });
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Broadcast receiver lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("wpa_supplicant broadcast channel closed");
                    return;
                }
            }
        }
    }

    /// Convert frequency (MHz) to channel number
    fn frequency_to_channel(freq_str: &str) -> u16 {
        let freq = freq_str.parse::<u16>().unwrap_or(0);
        match freq {
            2412 => 1,
            2417 => 2,
            2422 => 3,
            2427 => 4,
            2432 => 5,
            2437 => 6,
            2442 => 7,
            2447 => 8,
            2452 => 9,
            2457 => 10,
            2462 => 11,
            2467 => 12,
            2472 => 13,
            2484 => 14,
            // 5GHz channels (simplified)
            5180 => 36,
            5200 => 40,
            5220 => 44,
            5240 => 48,
            5260 => 52,
            5280 => 56,
            5300 => 60,
            5320 => 64,
            5500 => 100,
            5520 => 104,
            5540 => 108,
            5560 => 112,
            5580 => 116,
            5660 => 132,
            5680 => 136,
            5700 => 140,
            5745 => 149,
            5765 => 153,
            5785 => 157,
            5805 => 161,
            5825 => 165,
            _ => 0,
        }
    }

    /// Get IP address using ip command
    async fn get_ip_address(&self) -> Option<Ipv4Addr> {
        let output = Command::new("ip")
            .args(["-4", "addr", "show", &self.interface])
            .output()
            .await
            .ok()?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            let line = line.trim();
            if line.starts_with("inet ") {
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() >= 2 {
                    let ip = parts[1].split('/').next()?;
                    return ip.parse().ok();
                }
            }
        }

        None
    }

    async fn set_network_field(
        &self,
        network_id: NetworkId,
        field: &str,
        value: &str,
    ) -> WifiResult<()> {
        self.client
            .send_custom(format!("SET_NETWORK {} {} {}", network_id, field, value))
            .await
            .map_err(|e| {
                WifiError::WpaSupplicantError(format!("Failed to set {}: {}", field, e))
            })?;
        Ok(())
    }
}

impl WifiBackend for WifiCtrlBackend {
    async fn scan(&self) -> WifiResult<Vec<WifiNetwork>> {
        debug!("Starting WiFi scan on interface: {}", self.interface);

        let results = self
            .client
            .get_scan()
            .await
            .map_err(|e| WifiError::ScanFailed(e.to_string()))?;

        let mut networks = Vec::new();
        for res in results.iter() {
            networks.push(WifiNetwork {
                ssid: res.name.clone(),
                mac: res.mac.clone(),
                channel: Self::frequency_to_channel(&res.frequency),
                rssi: res.signal as i16,
            });
        }

        debug!("Scan complete, found {} networks", networks.len());
        Ok(networks)
    }

    async fn add_network(&self, credentials: &WifiCredentials) -> WifiResult<NetworkId> {
        debug!("Adding network configuration for: {}", credentials.ssid);

        let network_id =
            self.client.add_network().await.map_err(|e| {
                WifiError::WpaSupplicantError(format!("Failed to add network: {}", e))
            })?;

        // wifi-ctrl handles quoting internally via conf_escape
        self.client
            .set_network_ssid(network_id, credentials.ssid.clone())
            .await
            .map_err(|e| WifiError::WpaSupplicantError(format!("Failed to set SSID: {}", e)))?;

        match credentials.security {
            SecurityMode::Open => {
                self.set_network_field(network_id, "key_mgmt", "NONE").await?;
            }
            SecurityMode::Wep => {
                self.set_network_field(network_id, "key_mgmt", "NONE").await?;
                self.set_network_field(
                    network_id,
                    "wep_key0",
                    &format!("\"{}\"", credentials.password),
                )
                .await?;
            }
            SecurityMode::WpaWpa2 => {
                self.set_network_field(
                    network_id,
                    "psk",
                    &format!("\"{}\"", credentials.password),
                )
                .await?;
            }
        }

        Ok(network_id)
    }

    async fn remove_network(&self, network_id: NetworkId) -> WifiResult<()> {
        self.client
            .send_custom(format!("REMOVE_NETWORK {}", network_id))
            .await
            .map_err(|e| {
                WifiError::WpaSupplicantError(format!("Failed to remove network: {}", e))
            })?;
        Ok(())
    }

    async fn select_network(&self, network_id: NetworkId) -> WifiResult<()> {
        debug!("Selecting network {}", network_id);

        // Select network (enables it and selects it)
        self.client.select_network(network_id).await.map_err(|e| {
            WifiError::WpaSupplicantError(format!("Failed to select network: {}", e))
        })?;

        if let Err(e) = self.client.save_config().await {
            warn!("Failed to save wpa_supplicant config: {}", e);
        }

        Ok(())
    }

    async fn disconnect(&self) -> WifiResult<()> {
        debug!("Disconnecting");

        self.client
            .send_custom("DISCONNECT".to_string())
            .await
            .map_err(|e| WifiError::WpaSupplicantError(format!("Failed to disconnect: {}", e)))?;

        Ok(())
    }

    async fn status(&self) -> WifiResult<LinkStatus> {
        let status =
            self.client.get_status().await.map_err(|e| {
                WifiError::WpaSupplicantError(format!("Failed to get status: {}", e))
            })?;

        let wpa_state = status
            .get("wpa_state")
            .map(|s| s.as_str())
            .unwrap_or("UNKNOWN");

        let state = match wpa_state {
            "COMPLETED" => LinkState::Connected,
            "ASSOCIATING" | "AUTHENTICATING" | "4WAY_HANDSHAKE" | "GROUP_HANDSHAKE" => {
                LinkState::Connecting
            }
            "DISCONNECTED" | "INACTIVE" | "SCANNING" => LinkState::Idle,
            _ => LinkState::Idle,
        };

        let ssid = status.get("ssid").cloned();
        let network_id = status.get("id").and_then(|id| id.parse().ok());

        let ip_address = if state == LinkState::Connected {
            let parsed = status.get("ip_address").and_then(|ip| ip.parse().ok());
            match parsed {
                Some(ip) => Some(ip),
                None => self.get_ip_address().await,
            }
        } else {
            None
        };

        Ok(LinkStatus {
            state,
            ssid,
            ip_address,
            network_id,
        })
    }

    async fn radio_enabled(&self) -> WifiResult<bool> {
        let output = Command::new("ip")
            .args(["link", "show", "dev", &self.interface])
            .output()
            .await
            .map_err(|e| WifiError::InterfaceError(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.contains("state UP") || stdout.contains(",UP"))
    }

    async fn set_radio_enabled(&self, enabled: bool) -> WifiResult<()> {
        let action = if enabled { "up" } else { "down" };
        debug!("Setting interface {} {}", self.interface, action);

        let status = Command::new("ip")
            .args(["link", "set", "dev", &self.interface, action])
            .status()
            .await
            .map_err(|e| WifiError::InterfaceError(e.to_string()))?;

        if !status.success() {
            return Err(WifiError::InterfaceError(format!(
                "ip link set {} failed with {}",
                action, status
            )));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_to_channel_2_4ghz() {
        assert_eq!(WifiCtrlBackend::frequency_to_channel("2412"), 1);
        assert_eq!(WifiCtrlBackend::frequency_to_channel("2437"), 6);
        assert_eq!(WifiCtrlBackend::frequency_to_channel("2462"), 11);
        assert_eq!(WifiCtrlBackend::frequency_to_channel("2484"), 14);
    }

    #[test]
    fn test_frequency_to_channel_5ghz() {
        assert_eq!(WifiCtrlBackend::frequency_to_channel("5180"), 36);
        assert_eq!(WifiCtrlBackend::frequency_to_channel("5745"), 149);
        assert_eq!(WifiCtrlBackend::frequency_to_channel("5825"), 165);
    }

    #[test]
    fn test_frequency_to_channel_unmapped() {
        assert_eq!(WifiCtrlBackend::frequency_to_channel("9999"), 0);
        assert_eq!(WifiCtrlBackend::frequency_to_channel("invalid"), 0);
        assert_eq!(WifiCtrlBackend::frequency_to_channel(""), 0);
    }
}
