//! Domain types for device onboarding

use std::{net::Ipv4Addr, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Client key shared between the provisioning session and the components
/// that talk to the cloud relay on its behalf (resolution listener,
/// signal dispatch). Written once per session, read everywhere else.
pub type SharedClientKey = Arc<RwLock<Option<String>>>;

/// Identifier of a network configuration held by the WiFi backend
pub type NetworkId = usize;

/// Wireless security mode of a target network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    Open,
    Wep,
    WpaWpa2,
}

impl SecurityMode {
    /// Numeric code used on the credential wire format
    pub fn code(self) -> u8 {
        match self {
            SecurityMode::Open => 0,
            SecurityMode::Wep => 2,
            SecurityMode::WpaWpa2 => 8,
        }
    }
}

/// Credentials for a wireless network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WifiCredentials {
    /// Network SSID (up to 32 bytes UTF-8)
    pub ssid: String,
    /// Security mode
    pub security: SecurityMode,
    /// Passphrase; empty iff `security` is `Open`
    pub password: String,
}

/// Radio regulatory region selected from the caller's country code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RegulatoryDomain {
    Fcc = 0,
    Etsi = 1,
    Telec = 2,
}

/// ISO country codes regulated under FCC rules (ITU Region 2)
const FCC_TERRITORIES: &[&str] = &[
    "AG", "AI", "AR", "AW", "BB", "BM", "BS", "BZ", "CA", "CL", "CO", "CR", "CU", "DM", "DO",
    "EC", "GD", "GT", "GY", "HN", "HT", "JM", "KN", "KY", "LC", "MS", "MX", "NI", "PA", "PE",
    "PR", "PY", "SR", "SV", "TC", "TT", "US", "UY", "VC", "VE", "VG", "VI",
];

impl RegulatoryDomain {
    /// Select the regulatory domain for an ISO 3166-1 alpha-2 country code
    pub fn from_country_code(code: &str) -> Self {
        let upper = code.to_ascii_uppercase();
        if upper == "JP" {
            RegulatoryDomain::Telec
        } else if FCC_TERRITORIES.contains(&upper.as_str()) {
            RegulatoryDomain::Fcc
        } else {
            RegulatoryDomain::Etsi
        }
    }
}

/// Resolved local HTTP endpoint of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEndpoint {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl DeviceEndpoint {
    pub fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }

    /// Base URL for the device-local HTTP API
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

/// A known device, discovered locally or created at onboarding completion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Peripheral {
    /// Identity, unique per device lifetime
    pub hostname: String,
    /// User-facing name, defaults to the hostname
    pub customized_name: String,
    /// Backend-assigned device id; `None` until known
    pub device_id: Option<String>,
    /// Model name reported by the device; `None` until fetched
    pub model_name: Option<String>,
    /// Firmware version reported by the device; `None` until fetched
    pub firmware_version: Option<String>,
    /// Resolved local address and port; cleared when unreachable
    pub endpoint: Option<DeviceEndpoint>,
    /// Guards against scheduling duplicate device-id fetches
    #[serde(skip)]
    pub is_fetching_device_id: bool,
}

impl Peripheral {
    /// Create a peripheral known only by its hostname
    pub fn new(hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        Self {
            customized_name: hostname.clone(),
            hostname,
            device_id: None,
            model_name: None,
            firmware_version: None,
            endpoint: None,
            is_fetching_device_id: false,
        }
    }
}

/// An infrared signal owned by a device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signal {
    /// Id of the device this signal belongs to
    pub device_id: String,
    /// Carrier format, e.g. `"raw"`
    pub format: String,
    /// Carrier frequency in kHz
    pub freq: u16,
    /// Signal intervals
    pub data: Vec<u32>,
}

/// Cached device credentials scoped to one provisioning session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceKeyLease {
    pub device_key: String,
    pub device_id: String,
}

/// Raw wireless association events emitted by the WiFi backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Associated with a network; `address` is present once DHCP finished
    Associated {
        ssid: String,
        address: Option<Ipv4Addr>,
    },
    /// Authentication against a network was rejected
    AuthenticationFailed { ssid: String },
    /// Association was lost
    Disassociated { ssid: Option<String> },
}

/// WiFi link state reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    Failed,
}

/// Link status with the currently selected network configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: LinkState,
    pub ssid: Option<String>,
    pub ip_address: Option<Ipv4Addr>,
    /// Backend id of the selected network configuration, if any
    pub network_id: Option<NetworkId>,
}

/// Represents a discovered WiFi network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WifiNetwork {
    /// Network SSID
    pub ssid: String,
    /// MAC address (BSSID)
    pub mac: String,
    /// Channel number
    pub channel: u16,
    /// Signal strength in dBm
    pub rssi: i16,
}

/// Phases of a provisioning session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningPhase {
    Init,
    ObtainClientKey,
    ObtainDeviceKey,
    ScanForDeviceAp,
    ConnectDeviceAp,
    TransmitCredentials,
    WaitHomeNetwork,
    ConfirmConnectivity,
    Complete,
    Failed,
    Cancelled,
}

impl ProvisioningPhase {
    /// Human-readable phase description for status callbacks
    pub fn description(self) -> &'static str {
        match self {
            ProvisioningPhase::Init => "starting",
            ProvisioningPhase::ObtainClientKey => "obtaining client key",
            ProvisioningPhase::ObtainDeviceKey => "obtaining device key",
            ProvisioningPhase::ScanForDeviceAp => "scanning for device access point",
            ProvisioningPhase::ConnectDeviceAp => "connecting to device access point",
            ProvisioningPhase::TransmitCredentials => "transmitting credentials",
            ProvisioningPhase::WaitHomeNetwork => "waiting for home network",
            ProvisioningPhase::ConfirmConnectivity => "confirming connectivity",
            ProvisioningPhase::Complete => "complete",
            ProvisioningPhase::Failed => "failed",
            ProvisioningPhase::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ProvisioningPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Session identifier for provisioning sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_codes() {
        assert_eq!(SecurityMode::Open.code(), 0);
        assert_eq!(SecurityMode::Wep.code(), 2);
        assert_eq!(SecurityMode::WpaWpa2.code(), 8);
    }

    #[test]
    fn test_regulatory_domain_selection() {
        assert_eq!(
            RegulatoryDomain::from_country_code("JP"),
            RegulatoryDomain::Telec
        );
        assert_eq!(
            RegulatoryDomain::from_country_code("US"),
            RegulatoryDomain::Fcc
        );
        assert_eq!(
            RegulatoryDomain::from_country_code("ca"),
            RegulatoryDomain::Fcc
        );
        assert_eq!(
            RegulatoryDomain::from_country_code("DE"),
            RegulatoryDomain::Etsi
        );
        assert_eq!(
            RegulatoryDomain::from_country_code(""),
            RegulatoryDomain::Etsi
        );
    }

    #[test]
    fn test_device_endpoint_base_url() {
        let endpoint = DeviceEndpoint::new(Ipv4Addr::new(192, 168, 1, 1), 80);
        assert_eq!(endpoint.base_url(), "http://192.168.1.1:80");
    }

    #[test]
    fn test_peripheral_defaults() {
        let peripheral = Peripheral::new("irkitd45a");
        assert_eq!(peripheral.hostname, "irkitd45a");
        assert_eq!(peripheral.customized_name, "irkitd45a");
        assert!(peripheral.device_id.is_none());
        assert!(peripheral.endpoint.is_none());
        assert!(!peripheral.is_fetching_device_id);
    }

    #[test]
    fn test_peripheral_serde_skips_fetch_flag() {
        let mut peripheral = Peripheral::new("irkitd45a");
        peripheral.is_fetching_device_id = true;

        let json = serde_json::to_string(&peripheral).unwrap();
        let restored: Peripheral = serde_json::from_str(&json).unwrap();
        assert!(!restored.is_fetching_device_id);
    }
}
