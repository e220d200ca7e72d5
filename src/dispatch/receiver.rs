//! Fetching learned signals back from a device
//!
//! The inverse of dispatch: after the user points a remote at the device,
//! the newest learned signal is read locally when the device is reachable,
//! through the relay inbox otherwise, and lands in the signal repository.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    core::{
        error::{DispatchError, DispatchResult},
        registry::{PeripheralStore, SignalStore},
        types::{SharedClientKey, Signal},
    },
    transport::{DeviceTransport, RelayTransport, relay::fetch_inbox},
};

/// Reads the most recently learned signal of a peripheral
pub struct SignalReceiver<D, R> {
    device: Arc<D>,
    relay: Arc<R>,
    peripherals: Arc<dyn PeripheralStore>,
    signals: Arc<dyn SignalStore>,
    client_key: SharedClientKey,
    local_timeout: Duration,
}

impl<D: DeviceTransport, R: RelayTransport> SignalReceiver<D, R> {
    pub fn new(
        device: Arc<D>,
        relay: Arc<R>,
        peripherals: Arc<dyn PeripheralStore>,
        signals: Arc<dyn SignalStore>,
        client_key: SharedClientKey,
        local_timeout: Duration,
    ) -> Self {
        Self {
            device,
            relay,
            peripherals,
            signals,
            client_key,
            local_timeout,
        }
    }

    /// Fetch the newest learned signal of `hostname` and store it
    pub async fn fetch_latest(&self, hostname: &str) -> DispatchResult<Signal> {
        let peripheral = self
            .peripherals
            .get(hostname)
            .ok_or_else(|| DispatchError::UnknownDevice(hostname.to_string()))?;

        if let Some(endpoint) = peripheral.endpoint {
            match timeout(self.local_timeout, self.device.get_messages(&endpoint)).await {
                Ok(Ok(Some(message))) => {
                    debug!("Read learned signal locally from {}", hostname);
                    let signal =
                        message.into_signal(peripheral.device_id.clone().unwrap_or_default());
                    self.store_signal(signal.clone());
                    return Ok(signal);
                }
                Ok(Ok(None)) => {
                    debug!("No learned signal on {}, polling relay", hostname);
                }
                Ok(Err(e)) => {
                    debug!("Local read from {} failed ({}), polling relay", hostname, e);
                }
                Err(_) => {
                    warn!("Local read from {} timed out, marking unreachable", hostname);
                    self.peripherals.set_endpoint(hostname, None);
                }
            }
        }

        let client_key_value = self.client_key.read().await.clone();
        let Some(client_key_value) = client_key_value else {
            return Err(DispatchError::MissingClientKey);
        };

        let inbox = fetch_inbox(&*self.relay, &client_key_value).await?;
        let device_id = inbox
            .deviceid
            .or(peripheral.device_id)
            .unwrap_or_default();
        let signal = inbox.message.into_signal(device_id);
        self.store_signal(signal.clone());
        Ok(signal)
    }

    fn store_signal(&self, signal: Signal) {
        self.signals.add(signal);
        if let Err(e) = self.signals.save() {
            warn!("Failed to persist signal list: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::{MemoryPeripheralStore, MemorySignalStore};
    use crate::core::types::{DeviceEndpoint, Peripheral};
    use crate::protocol::{RelayInbox, SignalMessage};
    use crate::transport::{MockDeviceTransport, MockRelayTransport};
    use std::net::Ipv4Addr;

    struct Fixture {
        receiver: SignalReceiver<MockDeviceTransport, MockRelayTransport>,
        peripherals: Arc<MemoryPeripheralStore>,
        signals: Arc<MemorySignalStore>,
        device: MockDeviceTransport,
        relay: MockRelayTransport,
    }

    fn fixture() -> Fixture {
        let peripherals = Arc::new(MemoryPeripheralStore::new());
        let signals = Arc::new(MemorySignalStore::new());
        let device = MockDeviceTransport::new();
        let relay = MockRelayTransport::new();
        let client_key: SharedClientKey =
            Arc::new(tokio::sync::RwLock::new(Some("ck".to_string())));

        let receiver = SignalReceiver::new(
            Arc::new(device.clone()),
            Arc::new(relay.clone()),
            peripherals.clone() as Arc<dyn PeripheralStore>,
            signals.clone() as Arc<dyn SignalStore>,
            client_key,
            Duration::from_millis(3000),
        );

        Fixture {
            receiver,
            peripherals,
            signals,
            device,
            relay,
        }
    }

    fn reachable_peripheral(store: &MemoryPeripheralStore) {
        let mut peripheral = Peripheral::new("irkitd45a");
        peripheral.device_id = Some("dev1".to_string());
        peripheral.endpoint = Some(DeviceEndpoint::new(Ipv4Addr::new(10, 0, 0, 3), 80));
        store.add(peripheral);
    }

    fn learned_message() -> SignalMessage {
        SignalMessage {
            format: "raw".to_string(),
            freq: 38,
            data: vec![18031, 8755],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_fetch_stores_signal() {
        let f = fixture();
        reachable_peripheral(&f.peripherals);
        f.device.push_get_messages_result(Ok(Some(learned_message())));

        let signal = f.receiver.fetch_latest("irkitd45a").await.unwrap();
        assert_eq!(signal.device_id, "dev1");
        assert_eq!(f.signals.list().len(), 1);
        assert_eq!(f.relay.inbox_clear_flags().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_local_read_polls_relay() {
        let f = fixture();
        reachable_peripheral(&f.peripherals);
        f.relay.push_inbox_result(Ok(Some(RelayInbox {
            message: learned_message(),
            hostname: Some("irkitd45a".to_string()),
            deviceid: Some("dev1".to_string()),
        })));

        let signal = f.receiver.fetch_latest("irkitd45a").await.unwrap();
        assert_eq!(signal.device_id, "dev1");
        assert_eq!(f.device.get_messages_calls(), 1);
        assert_eq!(f.relay.inbox_clear_flags(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_timeout_marks_unreachable_then_polls_relay() {
        let f = fixture();
        reachable_peripheral(&f.peripherals);
        f.device.set_response_delay(Some(Duration::from_secs(10)));
        f.relay.push_inbox_result(Ok(Some(RelayInbox {
            message: learned_message(),
            hostname: None,
            deviceid: None,
        })));

        let signal = f.receiver.fetch_latest("irkitd45a").await.unwrap();
        // Device id falls back to the peripheral's
        assert_eq!(signal.device_id, "dev1");
        assert!(f.peripherals.get("irkitd45a").unwrap().endpoint.is_none());
    }

    #[tokio::test]
    async fn test_unknown_hostname_errors() {
        let f = fixture();
        let result = f.receiver.fetch_latest("nobody").await;
        assert!(matches!(result, Err(DispatchError::UnknownDevice(_))));
    }
}
