//! Service resolution listener maintaining the peripheral registry

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    config::Settings,
    core::{
        registry::PeripheralStore,
        types::{DeviceEndpoint, Peripheral, SharedClientKey},
    },
    discovery::browser::ServiceDiscoveryEvent,
    transport::{DeviceTransport, RelayTransport},
};

const RESOLVED_CHANNEL_CAPACITY: usize = 32;

/// Callbacks into the embedding application for discovery results
///
/// Invoked from background tasks; implementations must be cheap and
/// thread-safe.
pub trait DiscoveryObserver: Send + Sync + 'static {
    fn new_device_found(&self, peripheral: &Peripheral);
    fn existing_device_found(&self, peripheral: &Peripheral);
}

/// Consumes service-discovery events and keeps the registry current
///
/// Resolved services gain an endpoint and, where missing, a scheduled
/// device-id or model-info fetch; removed services lose their endpoint.
/// Every update to a resolved peripheral is also broadcast so concurrent
/// waiters (the provisioning session) see devices appear.
pub struct ResolutionListener<D, R> {
    store: Arc<dyn PeripheralStore>,
    device: Arc<D>,
    relay: Arc<R>,
    client_key: SharedClientKey,
    observer: Arc<dyn DiscoveryObserver>,
    resolved_tx: broadcast::Sender<Peripheral>,
    device_id_fetch_delay: Duration,
    model_fetch_delay: Duration,
}

impl<D: DeviceTransport, R: RelayTransport> ResolutionListener<D, R> {
    pub fn new(
        store: Arc<dyn PeripheralStore>,
        device: Arc<D>,
        relay: Arc<R>,
        client_key: SharedClientKey,
        observer: Arc<dyn DiscoveryObserver>,
        settings: &Settings,
    ) -> Self {
        let (resolved_tx, _) = broadcast::channel(RESOLVED_CHANNEL_CAPACITY);
        Self {
            store,
            device,
            relay,
            client_key,
            observer,
            resolved_tx,
            device_id_fetch_delay: settings.device_id_fetch_delay,
            model_fetch_delay: settings.model_fetch_delay,
        }
    }

    /// Subscribe to resolved-peripheral broadcasts
    pub fn subscribe_resolved(&self) -> broadcast::Receiver<Peripheral> {
        self.resolved_tx.subscribe()
    }

    /// Sender half of the resolved-peripheral broadcast, for wiring
    /// components that subscribe later
    pub fn resolved_sender(&self) -> broadcast::Sender<Peripheral> {
        self.resolved_tx.clone()
    }

    /// Consume events until the channel closes
    pub fn spawn(self, mut events: mpsc::Receiver<ServiceDiscoveryEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle(event).await;
            }
            debug!("Discovery event channel closed");
        })
    }

    async fn handle(&self, event: ServiceDiscoveryEvent) {
        match event {
            ServiceDiscoveryEvent::Added { name } => {
                debug!("Service added, awaiting resolution: {}", name);
            }
            ServiceDiscoveryEvent::Removed { name } => {
                debug!("Service removed, clearing endpoint: {}", name);
                self.store.set_endpoint(&name, None);
            }
            ServiceDiscoveryEvent::Resolved {
                name,
                address,
                port,
            } => {
                self.handle_resolved(name, DeviceEndpoint::new(address, port))
                    .await;
            }
        }
    }

    async fn handle_resolved(&self, name: String, endpoint: DeviceEndpoint) {
        let peripheral = match self.store.get(&name) {
            None => {
                let peripheral = Peripheral::new(name.clone());
                self.store.add(peripheral.clone());
                info!("New device found: {}", name);
                self.observer.new_device_found(&peripheral);
                peripheral
            }
            Some(peripheral) => {
                debug!("Existing device found: {}", name);
                self.observer.existing_device_found(&peripheral);
                peripheral
            }
        };

        self.store.set_endpoint(&name, Some(endpoint));

        if let Some(updated) = self.store.get(&name) {
            let _ = self.resolved_tx.send(updated);
        }

        if peripheral.device_id.is_none() {
            if !peripheral.is_fetching_device_id {
                self.store.set_fetching_device_id(&name, true);
                self.schedule_device_id_fetch(name);
            }
        } else if peripheral.model_name.is_none() {
            self.schedule_model_fetch(name);
        }
    }

    /// Fetch the device id off the discovery thread, after a settle delay
    fn schedule_device_id_fetch(&self, name: String) {
        let store = self.store.clone();
        let device = self.device.clone();
        let relay = self.relay.clone();
        let client_key = self.client_key.clone();
        let delay = self.device_id_fetch_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let endpoint = store.get(&name).and_then(|p| p.endpoint);
            let Some(endpoint) = endpoint else {
                store.set_fetching_device_id(&name, false);
                return;
            };

            let client_key_value = client_key.read().await.clone();
            let Some(client_key_value) = client_key_value else {
                debug!("No client key yet, skipping device-id fetch for {}", name);
                store.set_fetching_device_id(&name, false);
                return;
            };

            let result = async {
                let token = device.post_keys(&endpoint).await?;
                relay.register_client(&token, &client_key_value).await
            }
            .await;

            store.set_fetching_device_id(&name, false);
            match result {
                Ok(keys) => {
                    debug!("Fetched device id {} for {}", keys.deviceid, name);
                    store.assign_device_id(&name, &keys.deviceid);
                    if let Err(e) = store.save() {
                        warn!("Failed to persist registry: {}", e);
                    }
                }
                Err(e) => warn!("Device-id fetch for {} failed: {}", name, e),
            }
        });
    }

    /// Fetch model information off the discovery thread
    fn schedule_model_fetch(&self, name: String) {
        let store = self.store.clone();
        let device = self.device.clone();
        let delay = self.model_fetch_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let endpoint = store.get(&name).and_then(|p| p.endpoint);
            let Some(endpoint) = endpoint else { return };

            match device.probe(&endpoint).await {
                Ok(probe) => {
                    if let Some((model, firmware)) = probe.model() {
                        debug!("Device {} is {} {}", name, model, firmware);
                        store.set_model(&name, &model, &firmware);
                        if let Err(e) = store.save() {
                            warn!("Failed to persist registry: {}", e);
                        }
                    }
                }
                Err(e) => warn!("Model fetch for {} failed: {}", name, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::MemoryPeripheralStore;
    use crate::transport::{MockDeviceTransport, MockRelayTransport};
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingObserver {
        new_devices: Mutex<Vec<String>>,
        existing_devices: Mutex<Vec<String>>,
    }

    impl DiscoveryObserver for RecordingObserver {
        fn new_device_found(&self, peripheral: &Peripheral) {
            self.new_devices
                .lock()
                .unwrap()
                .push(peripheral.hostname.clone());
        }

        fn existing_device_found(&self, peripheral: &Peripheral) {
            self.existing_devices
                .lock()
                .unwrap()
                .push(peripheral.hostname.clone());
        }
    }

    struct Fixture {
        store: Arc<MemoryPeripheralStore>,
        device: MockDeviceTransport,
        relay: MockRelayTransport,
        observer: Arc<RecordingObserver>,
        events: mpsc::Sender<ServiceDiscoveryEvent>,
        client_key: SharedClientKey,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryPeripheralStore::new());
        let device = MockDeviceTransport::new();
        let relay = MockRelayTransport::new();
        let observer = Arc::new(RecordingObserver::default());
        let client_key: SharedClientKey = Arc::new(tokio::sync::RwLock::new(Some(
            "test-clientkey".to_string(),
        )));

        let listener = ResolutionListener::new(
            store.clone() as Arc<dyn PeripheralStore>,
            Arc::new(device.clone()),
            Arc::new(relay.clone()),
            client_key.clone(),
            observer.clone(),
            &Settings::default(),
        );

        let (tx, rx) = mpsc::channel(16);
        listener.spawn(rx);

        Fixture {
            store,
            device,
            relay,
            observer,
            events: tx,
            client_key,
        }
    }

    fn resolved(name: &str) -> ServiceDiscoveryEvent {
        ServiceDiscoveryEvent::Resolved {
            name: name.to_string(),
            address: Ipv4Addr::new(10, 0, 0, 3),
            port: 80,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_creates_peripheral_and_fetches_device_id() {
        let f = fixture();

        f.events.send(resolved("irkitd45a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let peripheral = f.store.get("irkitd45a").unwrap();
        assert_eq!(
            peripheral.endpoint,
            Some(DeviceEndpoint::new(Ipv4Addr::new(10, 0, 0, 3), 80))
        );
        assert!(peripheral.is_fetching_device_id);
        assert_eq!(f.observer.new_devices.lock().unwrap().as_slice(), ["irkitd45a"]);

        // Device-id fetch runs after its 2s settle delay
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(f.device.keys_calls(), 1);
        assert_eq!(
            f.relay.register_calls(),
            vec![("mock-client-token".to_string(), "test-clientkey".to_string())]
        );

        let peripheral = f.store.get("irkitd45a").unwrap();
        assert_eq!(peripheral.device_id.as_deref(), Some("mock-device"));
        assert!(!peripheral.is_fetching_device_id);
        assert!(f.store.persisted_snapshot().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_resolves_schedule_one_fetch() {
        let f = fixture();

        f.events.send(resolved("irkitd45a")).await.unwrap();
        f.events.send(resolved("irkitd45a")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(f.device.keys_calls(), 1);
        assert_eq!(f.observer.new_devices.lock().unwrap().len(), 1);
        assert_eq!(f.observer.existing_devices.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_with_device_id_fetches_model() {
        let f = fixture();

        let mut peripheral = Peripheral::new("irkitd45a");
        peripheral.device_id = Some("dev1".to_string());
        f.store.add(peripheral);

        f.events.send(resolved("irkitd45a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(f.device.probe_calls(), 1);
        let peripheral = f.store.get("irkitd45a").unwrap();
        assert_eq!(peripheral.model_name.as_deref(), Some("IRKit"));
        assert_eq!(peripheral.firmware_version.as_deref(), Some("3.0.0.0"));
        assert_eq!(f.observer.existing_devices.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_clears_endpoint() {
        let f = fixture();

        f.events.send(resolved("irkitd45a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.store.get("irkitd45a").unwrap().endpoint.is_some());

        f.events
            .send(ServiceDiscoveryEvent::Removed {
                name: "irkitd45a".to_string(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let peripheral = f.store.get("irkitd45a").unwrap();
        assert!(peripheral.endpoint.is_none());
        // The record itself survives; only reachability is lost
        assert_eq!(peripheral.hostname, "irkitd45a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_client_key_skips_device_id_fetch() {
        let f = fixture();
        *f.client_key.write().await = None;

        f.events.send(resolved("irkitd45a")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(f.device.keys_calls(), 0);
        assert!(!f.store.get("irkitd45a").unwrap().is_fetching_device_id);
    }
}
