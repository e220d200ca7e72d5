//! Strict-FIFO, single-flight signal transmission queue
//!
//! The device tolerates one request at a time, so every send is funneled
//! through one dispatcher task. Delivery prefers the local endpoint when
//! one is resolved, bounded by a short budget; an explicit local error
//! falls back to relayed delivery, a local timeout additionally marks the
//! peripheral unreachable first.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    core::{
        error::{DispatchError, DispatchResult},
        registry::PeripheralStore,
        types::{SharedClientKey, Signal},
    },
    protocol::SignalMessage,
    transport::{DeviceTransport, RelayTransport},
};

struct DispatchItem {
    signal: Signal,
    done: oneshot::Sender<DispatchResult<()>>,
}

/// Serialized signal transmission
///
/// `send` resolves when the queued delivery concluded; items are serviced
/// strictly in submission order with at most one delivery in flight.
#[derive(Clone)]
pub struct SignalDispatcher {
    tx: mpsc::UnboundedSender<DispatchItem>,
}

impl SignalDispatcher {
    pub fn new<D: DeviceTransport, R: RelayTransport>(
        device: Arc<D>,
        relay: Arc<R>,
        store: Arc<dyn PeripheralStore>,
        client_key: SharedClientKey,
        local_send_timeout: Duration,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<DispatchItem>();

        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let result = Self::deliver(
                    &*device,
                    &*relay,
                    &*store,
                    &client_key,
                    local_send_timeout,
                    &item.signal,
                )
                .await;
                let _ = item.done.send(result);
            }
            debug!("Signal dispatch queue closed");
        });

        Self { tx }
    }

    /// Queue a signal for transmission and wait for its conclusion
    pub async fn send(&self, signal: Signal) -> DispatchResult<()> {
        let (done, result) = oneshot::channel();
        self.tx
            .send(DispatchItem { signal, done })
            .map_err(|_| DispatchError::QueueClosed)?;
        result.await.map_err(|_| DispatchError::QueueClosed)?
    }

    async fn deliver<D: DeviceTransport, R: RelayTransport>(
        device: &D,
        relay: &R,
        store: &dyn PeripheralStore,
        client_key: &SharedClientKey,
        local_send_timeout: Duration,
        signal: &Signal,
    ) -> DispatchResult<()> {
        let peripheral = store
            .find_by_device_id(&signal.device_id)
            .ok_or_else(|| DispatchError::UnknownDevice(signal.device_id.clone()))?;
        let message = SignalMessage::from(signal);

        if let Some(endpoint) = peripheral.endpoint {
            match timeout(local_send_timeout, device.post_messages(&endpoint, &message)).await {
                Ok(Ok(())) => {
                    debug!("Delivered signal locally to {}", peripheral.hostname);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    debug!(
                        "Local delivery to {} failed ({}), falling back to relay",
                        peripheral.hostname, e
                    );
                }
                Err(_) => {
                    warn!(
                        "Local delivery to {} timed out, marking unreachable",
                        peripheral.hostname
                    );
                    store.set_endpoint(&peripheral.hostname, None);
                }
            }
        }

        let client_key_value = client_key.read().await.clone();
        let Some(client_key_value) = client_key_value else {
            return Err(DispatchError::MissingClientKey);
        };

        relay
            .post_messages(&client_key_value, &signal.device_id, &message)
            .await?;
        debug!("Delivered signal via relay for {}", signal.device_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::MemoryPeripheralStore;
    use crate::core::types::{DeviceEndpoint, Peripheral};
    use crate::transport::{MockDeviceTransport, MockRelayTransport};
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use tokio_test::assert_ok;

    const LOCAL_TIMEOUT: Duration = Duration::from_millis(3000);

    struct Fixture {
        dispatcher: SignalDispatcher,
        store: Arc<MemoryPeripheralStore>,
        device: MockDeviceTransport,
        relay: MockRelayTransport,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryPeripheralStore::new());
        let device = MockDeviceTransport::new();
        let relay = MockRelayTransport::new();
        let client_key: SharedClientKey =
            Arc::new(tokio::sync::RwLock::new(Some("ck".to_string())));

        let dispatcher = SignalDispatcher::new(
            Arc::new(device.clone()),
            Arc::new(relay.clone()),
            store.clone() as Arc<dyn PeripheralStore>,
            client_key,
            LOCAL_TIMEOUT,
        );

        Fixture {
            dispatcher,
            store,
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

    fn signal() -> Signal {
        Signal {
            device_id: "dev1".to_string(),
            format: "raw".to_string(),
            freq: 38,
            data: vec![18031, 8755, 1190],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_delivery_success_skips_relay() {
        let f = fixture();
        reachable_peripheral(&f.store);

        assert_ok!(f.dispatcher.send(signal()).await);

        assert_eq!(f.device.post_messages_calls().len(), 1);
        assert!(f.relay.post_messages_calls().is_empty());
        // Endpoint untouched on success
        assert!(f.store.get("irkitd45a").unwrap().endpoint.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_error_falls_back_to_relay() {
        let f = fixture();
        reachable_peripheral(&f.store);
        f.device.push_post_messages_result(Err(
            crate::core::error::TransportError::Status(503),
        ));

        assert_ok!(f.dispatcher.send(signal()).await);

        assert_eq!(f.device.post_messages_calls().len(), 1);
        assert_eq!(f.relay.post_messages_calls().len(), 1);
        // An explicit error is not unreachability; endpoint survives
        assert!(f.store.get("irkitd45a").unwrap().endpoint.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_timeout_clears_endpoint_then_relays() {
        let f = fixture();
        reachable_peripheral(&f.store);
        f.device.set_response_delay(Some(Duration::from_secs(10)));

        assert_ok!(f.dispatcher.send(signal()).await);

        assert!(f.store.get("irkitd45a").unwrap().endpoint.is_none());
        assert_eq!(f.relay.post_messages_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_peripheral_goes_straight_to_relay() {
        let f = fixture();
        let mut peripheral = Peripheral::new("irkitd45a");
        peripheral.device_id = Some("dev1".to_string());
        f.store.add(peripheral);

        assert_ok!(f.dispatcher.send(signal()).await);

        assert!(f.device.post_messages_calls().is_empty());
        assert_eq!(f.relay.post_messages_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_device_errors() {
        let f = fixture();

        let result = f.dispatcher.send(signal()).await;
        assert!(matches!(result, Err(DispatchError::UnknownDevice(id)) if id == "dev1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_error_surfaces() {
        let f = fixture();
        let mut peripheral = Peripheral::new("irkitd45a");
        peripheral.device_id = Some("dev1".to_string());
        f.store.add(peripheral);
        f.relay
            .push_post_messages_result(Err(crate::core::error::TransportError::Status(500)));

        let result = f.dispatcher.send(signal()).await;
        assert!(matches!(result, Err(DispatchError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order_and_single_flight() {
        let f = fixture();
        reachable_peripheral(&f.store);
        f.device.set_response_delay(Some(Duration::from_millis(100)));

        let completed: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

        let tracked = |index: u32| {
            let dispatcher = f.dispatcher.clone();
            let completed = completed.clone();
            let mut item = signal();
            item.data = vec![index];
            async move {
                dispatcher.send(item).await.unwrap();
                completed.lock().unwrap().push(index);
            }
        };

        // join! polls in declaration order, so submission order is 0..5
        tokio::join!(tracked(0), tracked(1), tracked(2), tracked(3), tracked(4));

        assert_eq!(*completed.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(f.device.max_inflight(), 1);

        let delivered: Vec<u32> = f
            .device
            .post_messages_calls()
            .iter()
            .map(|(_, message)| message.data[0])
            .collect();
        assert_eq!(delivered, vec![0, 1, 2, 3, 4]);
    }
}
