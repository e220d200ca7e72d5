//! Main onboarding service facade

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
    backend::WifiBackend,
    config::Settings,
    core::{
        error::DispatchResult,
        provisioner::{Provisioner, ProvisioningConfig, ProvisioningObserver},
        registry::{PeripheralStore, SignalStore},
        types::{Peripheral, SessionId, SharedClientKey, Signal},
    },
    discovery::{DiscoveryObserver, DiscoveryQueue, ResolutionListener, ServiceBrowser},
    dispatch::{SignalDispatcher, SignalReceiver},
    transport::{DeviceTransport, RelayTransport},
};

const DISCOVERY_EVENT_CAPACITY: usize = 64;

/// Main onboarding service facade
///
/// Wires the provisioning state machine, discovery pipeline and signal
/// queues around the injected backend, transports and repositories, and
/// exposes the handful of operations the embedding application calls.
pub struct OnboardingService<B, W, D, R> {
    pub provisioner: Arc<Provisioner<B, W, D, R>>,
    pub discovery: Arc<DiscoveryQueue<W>>,
    pub dispatcher: SignalDispatcher,
    pub receiver: Arc<SignalReceiver<D, R>>,
    peripherals: Arc<dyn PeripheralStore>,
}

impl<B, W, D, R> OnboardingService<B, W, D, R>
where
    B: WifiBackend,
    W: ServiceBrowser,
    D: DeviceTransport,
    R: RelayTransport,
{
    /// Create a new onboarding service
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<B>,
        browser: Arc<W>,
        device: Arc<D>,
        relay: Arc<R>,
        peripherals: Arc<dyn PeripheralStore>,
        signals: Arc<dyn SignalStore>,
        discovery_observer: Arc<dyn DiscoveryObserver>,
        settings: Settings,
    ) -> Self {
        let client_key: SharedClientKey = Default::default();

        let (events_tx, events_rx) = mpsc::channel(DISCOVERY_EVENT_CAPACITY);
        let discovery = Arc::new(DiscoveryQueue::new(browser, events_tx));

        let listener = ResolutionListener::new(
            peripherals.clone(),
            device.clone(),
            relay.clone(),
            client_key.clone(),
            discovery_observer,
            &settings,
        );
        let resolved_tx = listener.resolved_sender();
        listener.spawn(events_rx);

        let provisioner = Arc::new(Provisioner::new(
            backend,
            device.clone(),
            relay.clone(),
            peripherals.clone(),
            discovery.clone(),
            resolved_tx,
            client_key.clone(),
            settings.clone(),
        ));

        let dispatcher = SignalDispatcher::new(
            device.clone(),
            relay.clone(),
            peripherals.clone(),
            client_key.clone(),
            settings.local_send_timeout,
        );

        let receiver = Arc::new(SignalReceiver::new(
            device,
            relay,
            peripherals.clone(),
            signals,
            client_key,
            settings.local_send_timeout,
        ));

        Self {
            provisioner,
            discovery,
            dispatcher,
            receiver,
            peripherals,
        }
    }

    /// Start onboarding a device, or attach to the session in progress
    pub fn start_provisioning(
        &self,
        config: ProvisioningConfig,
        observer: Arc<dyn ProvisioningObserver>,
    ) -> SessionId {
        self.provisioner.start(config, observer)
    }

    /// Cancel the active provisioning session
    pub fn cancel_provisioning(&self) {
        self.provisioner.cancel();
    }

    /// Request that local discovery runs
    pub async fn start_discovery(&self) {
        self.discovery.request(true).await;
    }

    /// Request that local discovery stops
    pub async fn stop_discovery(&self) {
        self.discovery.request(false).await;
    }

    /// Queue a signal for delivery to its device
    pub async fn send_signal(&self, signal: Signal) -> DispatchResult<()> {
        self.dispatcher.send(signal).await
    }

    /// Fetch the newest learned signal of a device
    pub async fn fetch_latest_signal(&self, hostname: &str) -> DispatchResult<Signal> {
        self.receiver.fetch_latest(hostname).await
    }

    /// Known peripherals
    pub fn peripherals(&self) -> Vec<Peripheral> {
        self.peripherals.list()
    }
}
