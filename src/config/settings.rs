//! Runtime settings

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::core::types::DeviceEndpoint;

/// Runtime configuration settings
///
/// Collects every endpoint, timeout and retry budget of the onboarding
/// flow. The embedding application constructs this (defaults match the
/// production device firmware) and hands it to the service.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Cloud relay base URL
    pub relay_base_url: String,
    /// mDNS service type the devices advertise
    pub service_type: String,
    /// SSID prefix of the temporary device access point
    pub device_ap_prefix: String,
    /// Fixed device endpoint while associated with its access point
    pub device_ap_endpoint: DeviceEndpoint,
    /// Baseline timeout for single HTTP requests
    pub http_timeout: Duration,
    /// Timeout for obtaining the device key
    pub device_key_timeout: Duration,
    /// Overall budget for finding the device access point
    pub scan_timeout: Duration,
    /// Timeout for associating with the device access point
    pub connect_timeout: Duration,
    /// Per-attempt timeout for credential transmission
    pub transmit_timeout: Duration,
    /// Credential transmission attempts before giving up
    pub transmit_attempts: u32,
    /// Pause between credential transmission attempts
    pub transmit_backoff: Duration,
    /// Overall budget for connectivity confirmation
    pub confirm_timeout: Duration,
    /// Settle delay after associating with the device access point
    pub settle_after_device_ap: Duration,
    /// Settle delay after rejoining the home network
    pub settle_after_home: Duration,
    /// Budget for one local delivery attempt before falling back to relay
    pub local_send_timeout: Duration,
    /// Delay before fetching the device id of a resolved peripheral
    pub device_id_fetch_delay: Duration,
    /// Delay before fetching model information of a resolved peripheral
    pub model_fetch_delay: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            relay_base_url: "https://api.getirkit.com".to_string(),
            service_type: "_irkit._tcp.local.".to_string(),
            device_ap_prefix: "IRKit".to_string(),
            device_ap_endpoint: DeviceEndpoint::new(Ipv4Addr::new(192, 168, 1, 1), 80),
            http_timeout: Duration::from_secs(10),
            device_key_timeout: Duration::from_secs(30),
            scan_timeout: Duration::from_secs(50),
            connect_timeout: Duration::from_secs(30),
            transmit_timeout: Duration::from_secs(30),
            transmit_attempts: 5,
            transmit_backoff: Duration::from_secs(1),
            confirm_timeout: Duration::from_secs(30),
            settle_after_device_ap: Duration::from_millis(2000),
            settle_after_home: Duration::from_millis(500),
            local_send_timeout: Duration::from_millis(3000),
            device_id_fetch_delay: Duration::from_millis(2000),
            model_fetch_delay: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_budgets() {
        let settings = Settings::default();
        assert_eq!(settings.scan_timeout, Duration::from_secs(50));
        assert_eq!(settings.transmit_attempts, 5);
        assert_eq!(settings.local_send_timeout, Duration::from_millis(3000));
        assert_eq!(settings.device_ap_endpoint.base_url(), "http://192.168.1.1:80");
    }
}
