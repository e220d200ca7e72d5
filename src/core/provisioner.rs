//! Provisioning state machine driving the network handoff
//!
//! One session at a time walks the device from its temporary access point
//! onto the home network: obtain keys, find and join the device AP,
//! transmit encoded credentials, rejoin the home network, then confirm the
//! device both against the cloud relay and on the local network. Each
//! phase carries its own timeout and retry policy; any terminal failure or
//! cancellation rolls the radio back to its pre-session state exactly
//! once. Cancellation is cooperative: every continuation re-checks the
//! session before acting, so stale completions are discarded silently.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::{
    backend::WifiBackend,
    config::Settings,
    core::{
        error::{ProvisioningError, ProvisioningResult, TransportError},
        registry::PeripheralStore,
        types::{DeviceKeyLease, LinkStatus, NetworkId, Peripheral, ProvisioningPhase,
            RegulatoryDomain, SecurityMode, SessionId, SharedClientKey, WifiCredentials,
            WifiNetwork},
        watcher::{ConnectivityWatcher, NetworkMatcher, WatchOutcome},
    },
    discovery::{DiscoveryQueue, ServiceBrowser},
    protocol::encode_credentials,
    transport::{DeviceTransport, RelayTransport, relay::wait_for_door},
};

/// Pause between rescans while hunting for the device access point
const RESCAN_PAUSE: std::time::Duration = std::time::Duration::from_secs(1);

/// Callbacks into the embedding application for provisioning progress
///
/// Invoked from background tasks; implementations must be cheap and
/// thread-safe.
pub trait ProvisioningObserver: Send + Sync + 'static {
    fn status(&self, phase: ProvisioningPhase);
    fn error(&self, message: &str);
    fn complete(&self);
}

/// Caller-supplied parameters for one onboarding run
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// Relay API key identifying the application
    pub api_key: String,
    /// Home network the device should end up on
    pub credentials: WifiCredentials,
    /// Passphrase of the temporary device access point
    pub device_ap_password: String,
    /// ISO country code selecting the radio regulatory domain
    pub country_code: String,
}

/// Network state to restore when a session ends early
#[derive(Debug, Default)]
struct RollbackState {
    touched: bool,
    original: Option<LinkStatus>,
    original_radio: bool,
    temp_network: Option<NetworkId>,
    rolled_back: bool,
}

struct SessionCtx<B, W, D, R> {
    backend: Arc<B>,
    device: Arc<D>,
    relay: Arc<R>,
    store: Arc<dyn PeripheralStore>,
    discovery: Arc<DiscoveryQueue<W>>,
    resolved_tx: broadcast::Sender<Peripheral>,
    client_key: SharedClientKey,
    settings: Settings,
    config: ProvisioningConfig,
    active: Arc<AtomicBool>,
    cancel_rx: watch::Receiver<bool>,
    observers: Arc<StdMutex<Vec<Arc<dyn ProvisioningObserver>>>>,
    rollback: Mutex<RollbackState>,
    lease: Mutex<Option<DeviceKeyLease>>,
}

struct Session {
    id: SessionId,
    active: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
    observers: Arc<StdMutex<Vec<Arc<dyn ProvisioningObserver>>>>,
}

/// Onboarding orchestrator; see the module docs for the phase walk
pub struct Provisioner<B, W, D, R> {
    backend: Arc<B>,
    device: Arc<D>,
    relay: Arc<R>,
    store: Arc<dyn PeripheralStore>,
    discovery: Arc<DiscoveryQueue<W>>,
    resolved_tx: broadcast::Sender<Peripheral>,
    client_key: SharedClientKey,
    settings: Settings,
    session: StdMutex<Option<Session>>,
}

impl<B, W, D, R> Provisioner<B, W, D, R>
where
    B: WifiBackend,
    W: ServiceBrowser,
    D: DeviceTransport,
    R: RelayTransport,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<B>,
        device: Arc<D>,
        relay: Arc<R>,
        store: Arc<dyn PeripheralStore>,
        discovery: Arc<DiscoveryQueue<W>>,
        resolved_tx: broadcast::Sender<Peripheral>,
        client_key: SharedClientKey,
        settings: Settings,
    ) -> Self {
        Self {
            backend,
            device,
            relay,
            store,
            discovery,
            resolved_tx,
            client_key,
            settings,
            session: StdMutex::new(None),
        }
    }

    /// Start a provisioning session, or attach to the active one
    ///
    /// No concurrent sessions exist; a second `start` while a session is
    /// active only adds its observer and returns the running session's id.
    pub fn start(
        &self,
        config: ProvisioningConfig,
        observer: Arc<dyn ProvisioningObserver>,
    ) -> SessionId {
        let mut slot = self.session.lock().unwrap();

        if let Some(session) = slot.as_ref() {
            if session.active.load(Ordering::SeqCst) {
                debug!("Attaching observer to active session {}", session.id);
                session.observers.lock().unwrap().push(observer);
                return session.id;
            }
        }

        let id = SessionId::new();
        let active = Arc::new(AtomicBool::new(true));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let observers = Arc::new(StdMutex::new(vec![observer]));

        let ctx = Arc::new(SessionCtx {
            backend: self.backend.clone(),
            device: self.device.clone(),
            relay: self.relay.clone(),
            store: self.store.clone(),
            discovery: self.discovery.clone(),
            resolved_tx: self.resolved_tx.clone(),
            client_key: self.client_key.clone(),
            settings: self.settings.clone(),
            config,
            active: active.clone(),
            cancel_rx,
            observers: observers.clone(),
            rollback: Mutex::new(RollbackState::default()),
            lease: Mutex::new(None),
        });

        info!("Starting provisioning session {}", id);
        *slot = Some(Session {
            id,
            active,
            cancel_tx,
            observers,
        });
        tokio::spawn(Self::run(ctx));
        id
    }

    /// Cancel the active session, if any
    ///
    /// The session task notices at its next continuation, performs the
    /// single rollback and ends without surfacing an error.
    pub fn cancel(&self) {
        let slot = self.session.lock().unwrap();
        if let Some(session) = slot.as_ref() {
            if session.active.swap(false, Ordering::SeqCst) {
                info!("Cancelling provisioning session {}", session.id);
                let _ = session.cancel_tx.send(true);
            }
        }
    }

    /// Whether a session is currently active
    pub fn is_active(&self) -> bool {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|s| s.active.load(Ordering::SeqCst))
    }

    async fn run(ctx: Arc<SessionCtx<B, W, D, R>>) {
        match Self::drive(&ctx).await {
            Ok(hostname) => {
                info!("Provisioning complete, device {} confirmed", hostname);
                Self::notify_status(&ctx, ProvisioningPhase::Complete);
                for observer in Self::observers(&ctx) {
                    observer.complete();
                }
            }
            Err(ProvisioningError::Cancelled) => {
                Self::rollback(&ctx).await;
                Self::notify_status(&ctx, ProvisioningPhase::Cancelled);
            }
            Err(e) => {
                warn!("Provisioning failed: {}", e);
                Self::rollback(&ctx).await;
                Self::notify_status(&ctx, ProvisioningPhase::Failed);
                for observer in Self::observers(&ctx) {
                    observer.error(&e.to_string());
                }
            }
        }

        ctx.active.store(false, Ordering::SeqCst);
        *ctx.lease.lock().await = None;
    }

    async fn drive(ctx: &SessionCtx<B, W, D, R>) -> ProvisioningResult<String> {
        // No phase timeout here beyond the transport's own
        Self::notify_status(ctx, ProvisioningPhase::ObtainClientKey);
        let client_key =
            Self::with_cancel(ctx, ctx.relay.obtain_client_key(&ctx.config.api_key))
                .await?
                .map_err(ProvisioningError::from_transport)?;
        *ctx.client_key.write().await = Some(client_key.clone());

        Self::notify_status(ctx, ProvisioningPhase::ObtainDeviceKey);
        let devices = Self::with_cancel(
            ctx,
            timeout(
                ctx.settings.device_key_timeout,
                ctx.relay.obtain_device_key(&client_key),
            ),
        )
        .await?
        .map_err(|_| ProvisioningError::Timeout {
            phase: ProvisioningPhase::ObtainDeviceKey,
        })?
        .map_err(ProvisioningError::from_transport)?;

        let lease = DeviceKeyLease {
            device_key: devices.devicekey,
            device_id: devices.deviceid,
        };
        *ctx.lease.lock().await = Some(lease.clone());

        Self::notify_status(ctx, ProvisioningPhase::ScanForDeviceAp);
        let access_point = Self::with_cancel(
            ctx,
            timeout(ctx.settings.scan_timeout, Self::scan_for_device_ap(ctx)),
        )
        .await?
        .map_err(|_| ProvisioningError::Timeout {
            phase: ProvisioningPhase::ScanForDeviceAp,
        })??;

        Self::notify_status(ctx, ProvisioningPhase::ConnectDeviceAp);
        Self::connect_device_ap(ctx, &access_point).await?;
        Self::with_cancel(ctx, sleep(ctx.settings.settle_after_device_ap)).await?;

        Self::notify_status(ctx, ProvisioningPhase::TransmitCredentials);
        let domain = RegulatoryDomain::from_country_code(&ctx.config.country_code);
        let credential =
            encode_credentials(&ctx.config.credentials, &lease.device_key, domain)
                .map_err(|e| ProvisioningError::Protocol(e.to_string()))?;
        Self::transmit_credentials(ctx, &credential).await?;

        Self::notify_status(ctx, ProvisioningPhase::WaitHomeNetwork);
        Self::rejoin_home_network(ctx).await?;
        Self::with_cancel(ctx, sleep(ctx.settings.settle_after_home)).await?;

        // Local discovery runs concurrently with the confirmation
        Self::notify_status(ctx, ProvisioningPhase::ConfirmConnectivity);
        let hostname = Self::with_cancel(
            ctx,
            timeout(ctx.settings.confirm_timeout, Self::confirm(ctx, &lease)),
        )
        .await?
        .map_err(|_| ProvisioningError::Timeout {
            phase: ProvisioningPhase::ConfirmConnectivity,
        })??;

        // Persist the confirmed device
        if ctx.store.get(&hostname).is_none() {
            ctx.store.add(Peripheral::new(hostname.clone()));
        }
        ctx.store.assign_device_id(&hostname, &lease.device_id);
        if let Err(e) = ctx.store.save() {
            warn!("Failed to persist registry: {}", e);
        }

        Ok(hostname)
    }

    /// Rescan until an SSID with the device prefix shows up
    async fn scan_for_device_ap(
        ctx: &SessionCtx<B, W, D, R>,
    ) -> ProvisioningResult<WifiNetwork> {
        loop {
            let networks = ctx.backend.scan().await?;
            if let Some(network) = networks
                .iter()
                .find(|n| n.ssid.starts_with(ctx.settings.device_ap_prefix.as_str()))
            {
                debug!("Found device access point: {}", network.ssid);
                return Ok(network.clone());
            }
            sleep(RESCAN_PAUSE).await;
        }
    }

    async fn connect_device_ap(
        ctx: &SessionCtx<B, W, D, R>,
        access_point: &WifiNetwork,
    ) -> ProvisioningResult<()> {
        // Snapshot what to restore on rollback before touching the radio
        {
            let mut rollback = ctx.rollback.lock().await;
            rollback.touched = true;
            rollback.original = ctx.backend.status().await.ok();
            rollback.original_radio = ctx.backend.radio_enabled().await.unwrap_or(true);
        }

        let ap_credentials = WifiCredentials {
            ssid: access_point.ssid.clone(),
            security: SecurityMode::WpaWpa2,
            password: ctx.config.device_ap_password.clone(),
        };

        let events = ctx.backend.subscribe();
        let temp_network =
            Self::with_cancel(ctx, ctx.backend.add_network(&ap_credentials)).await??;
        ctx.rollback.lock().await.temp_network = Some(temp_network);
        Self::with_cancel(ctx, ctx.backend.select_network(temp_network)).await??;

        let watcher = ConnectivityWatcher::new(
            events,
            NetworkMatcher::Exact(access_point.ssid.clone()),
            Some(ctx.settings.connect_timeout),
        );
        match Self::with_cancel(ctx, watcher.wait()).await?? {
            WatchOutcome::Connected { ssid, address } => {
                debug!("Joined device access point {} at {}", ssid, address);
                Ok(())
            }
            WatchOutcome::AuthenticationFailed => {
                Err(ProvisioningError::Authentication(access_point.ssid.clone()))
            }
            WatchOutcome::TimedOut => Err(ProvisioningError::Timeout {
                phase: ProvisioningPhase::ConnectDeviceAp,
            }),
        }
    }

    /// Bounded attempts against the device's fixed AP endpoint
    ///
    /// The device reboots onto the home network as soon as it accepts the
    /// credentials, so a dropped connection counts as delivered.
    async fn transmit_credentials(
        ctx: &SessionCtx<B, W, D, R>,
        credential: &str,
    ) -> ProvisioningResult<()> {
        let attempts = ctx.settings.transmit_attempts;
        let endpoint = ctx.settings.device_ap_endpoint;

        for attempt in 1..=attempts {
            let result = Self::with_cancel(
                ctx,
                timeout(
                    ctx.settings.transmit_timeout,
                    ctx.device.post_wifi(&endpoint, credential),
                ),
            )
            .await?;

            match result {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(TransportError::ConnectionReset(_))) => {
                    debug!("Device left the network mid-transmission, treating as delivered");
                    return Ok(());
                }
                Ok(Err(e)) => debug!("Credential transmission attempt {} failed: {}", attempt, e),
                Err(_) => debug!("Credential transmission attempt {} timed out", attempt),
            }

            if attempt < attempts {
                Self::with_cancel(ctx, sleep(ctx.settings.transmit_backoff)).await?;
            }
        }

        Err(ProvisioningError::RetryBudgetExceeded {
            phase: ProvisioningPhase::TransmitCredentials,
            attempts,
        })
    }

    /// Rejoin the home network, reusing the original configuration when it
    /// matches, and wait for the association event
    async fn rejoin_home_network(ctx: &SessionCtx<B, W, D, R>) -> ProvisioningResult<()> {
        let events = ctx.backend.subscribe();
        let home_ssid = ctx.config.credentials.ssid.clone();

        let original = {
            let rollback = ctx.rollback.lock().await;
            rollback.original.clone()
        };

        let reusable = original
            .as_ref()
            .filter(|status| status.ssid.as_deref() == Some(home_ssid.as_str()))
            .and_then(|status| status.network_id);

        match reusable {
            Some(network_id) => {
                debug!("Reconnecting to original home network configuration");
                Self::with_cancel(ctx, ctx.backend.select_network(network_id)).await??;
            }
            None => {
                debug!("Joining home network {}", home_ssid);
                let network_id =
                    Self::with_cancel(ctx, ctx.backend.add_network(&ctx.config.credentials))
                        .await??;
                Self::with_cancel(ctx, ctx.backend.select_network(network_id)).await??;
            }
        }

        let watcher =
            ConnectivityWatcher::new(events, NetworkMatcher::Exact(home_ssid.clone()), None);
        match Self::with_cancel(ctx, watcher.wait()).await?? {
            WatchOutcome::Connected { .. } => Ok(()),
            WatchOutcome::AuthenticationFailed => Err(ProvisioningError::Authentication(home_ssid)),
            WatchOutcome::TimedOut => Err(ProvisioningError::Timeout {
                phase: ProvisioningPhase::WaitHomeNetwork,
            }),
        }
    }

    /// Server confirmation and local discovery; both must hold to finish
    async fn confirm(
        ctx: &SessionCtx<B, W, D, R>,
        lease: &DeviceKeyLease,
    ) -> ProvisioningResult<String> {
        // Local discovery runs while the relay long-poll is in flight
        let mut resolved_rx = ctx.resolved_tx.subscribe();
        ctx.discovery.request(true).await;

        let client_key = ctx
            .client_key
            .read()
            .await
            .clone()
            .ok_or_else(|| ProvisioningError::Protocol("client key missing".into()))?;

        // One transparent retry on a transient failure of the confirmation
        let mut hostname = None;
        for attempt in 0..2 {
            match wait_for_door(&*ctx.relay, &client_key, &lease.device_id).await {
                Ok(found) => {
                    hostname = Some(found);
                    break;
                }
                Err(e) if e.is_transient() && attempt == 0 => {
                    debug!("Door confirmation failed transiently ({}), retrying", e);
                }
                Err(e) => return Err(ProvisioningError::from_transport(e)),
            }
        }
        let hostname = hostname.ok_or_else(|| {
            ProvisioningError::Transient("door confirmation failed twice".into())
        })?;
        debug!("Server confirmed device {}", hostname);

        // Server predicate holds; now the device must appear locally
        if ctx
            .store
            .get(&hostname)
            .and_then(|p| p.endpoint)
            .is_some()
        {
            return Ok(hostname);
        }

        loop {
            match resolved_rx.recv().await {
                Ok(peripheral) if peripheral.hostname == hostname => return Ok(hostname),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if ctx
                        .store
                        .get(&hostname)
                        .and_then(|p| p.endpoint)
                        .is_some()
                    {
                        return Ok(hostname);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ProvisioningError::Protocol(
                        "discovery event stream closed".into(),
                    ));
                }
            }
        }
    }

    /// Restore the pre-session network state; runs at most once
    async fn rollback(ctx: &SessionCtx<B, W, D, R>) {
        let (original, original_radio, temp_network) = {
            let mut rollback = ctx.rollback.lock().await;
            if rollback.rolled_back || !rollback.touched {
                rollback.rolled_back = true;
                return;
            }
            rollback.rolled_back = true;
            (
                rollback.original.clone(),
                rollback.original_radio,
                rollback.temp_network.take(),
            )
        };

        info!("Rolling back network state");

        if let Some(network_id) = temp_network {
            if let Err(e) = ctx.backend.remove_network(network_id).await {
                warn!("Failed to remove temporary network: {}", e);
            }
        }

        match original.and_then(|status| status.network_id) {
            Some(network_id) => {
                if let Err(e) = ctx.backend.select_network(network_id).await {
                    warn!("Failed to reselect original network: {}", e);
                }
            }
            None => {
                if let Err(e) = ctx.backend.disconnect().await {
                    warn!("Failed to disconnect: {}", e);
                }
                if let Err(e) = ctx.backend.set_radio_enabled(original_radio).await {
                    warn!("Failed to restore radio state: {}", e);
                }
            }
        }
    }

    /// Race a future against cancellation, re-checking the session after
    /// completion so stale results are dropped
    async fn with_cancel<T>(
        ctx: &SessionCtx<B, W, D, R>,
        future: impl Future<Output = T>,
    ) -> ProvisioningResult<T> {
        Self::ensure_active(ctx)?;
        let mut cancel_rx = ctx.cancel_rx.clone();
        tokio::select! {
            _ = cancel_rx.changed() => Err(ProvisioningError::Cancelled),
            value = future => {
                Self::ensure_active(ctx)?;
                Ok(value)
            }
        }
    }

    fn ensure_active(ctx: &SessionCtx<B, W, D, R>) -> ProvisioningResult<()> {
        if ctx.active.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProvisioningError::Cancelled)
        }
    }

    fn observers(ctx: &SessionCtx<B, W, D, R>) -> Vec<Arc<dyn ProvisioningObserver>> {
        ctx.observers.lock().unwrap().clone()
    }

    fn notify_status(ctx: &SessionCtx<B, W, D, R>, phase: ProvisioningPhase) {
        debug!("Provisioning phase: {}", phase);
        for observer in Self::observers(ctx) {
            observer.status(phase);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockWifiBackend;
    use crate::core::registry::MemoryPeripheralStore;
    use crate::core::types::DeviceEndpoint;
    use crate::discovery::MockServiceBrowser;
    use crate::transport::{MockDeviceTransport, MockRelayTransport};
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingObserver {
        statuses: StdMutex<Vec<ProvisioningPhase>>,
        errors: StdMutex<Vec<String>>,
        completions: AtomicUsize,
    }

    impl RecordingObserver {
        fn statuses(&self) -> Vec<ProvisioningPhase> {
            self.statuses.lock().unwrap().clone()
        }

        fn saw(&self, phase: ProvisioningPhase) -> bool {
            self.statuses().contains(&phase)
        }
    }

    impl ProvisioningObserver for RecordingObserver {
        fn status(&self, phase: ProvisioningPhase) {
            self.statuses.lock().unwrap().push(phase);
        }

        fn error(&self, message: &str) {
            self.errors.lock().unwrap().push(message.to_string());
        }

        fn complete(&self) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        provisioner:
            Provisioner<MockWifiBackend, MockServiceBrowser, MockDeviceTransport, MockRelayTransport>,
        backend: MockWifiBackend,
        device: MockDeviceTransport,
        relay: MockRelayTransport,
        store: Arc<MemoryPeripheralStore>,
        browser: Arc<MockServiceBrowser>,
        resolved_tx: broadcast::Sender<Peripheral>,
        client_key: SharedClientKey,
    }

    fn fixture() -> Fixture {
        let backend = MockWifiBackend::new();
        let device = MockDeviceTransport::new();
        let relay = MockRelayTransport::new();
        let store = Arc::new(MemoryPeripheralStore::new());
        let browser = Arc::new(MockServiceBrowser::new());
        let (events_tx, _events_rx) = mpsc::channel(16);
        let discovery = Arc::new(DiscoveryQueue::new(browser.clone(), events_tx));
        let (resolved_tx, _) = broadcast::channel(16);
        let client_key: SharedClientKey = Arc::new(tokio::sync::RwLock::new(None));

        let provisioner = Provisioner::new(
            Arc::new(backend.clone()),
            Arc::new(device.clone()),
            Arc::new(relay.clone()),
            store.clone() as Arc<dyn PeripheralStore>,
            discovery,
            resolved_tx.clone(),
            client_key.clone(),
            Settings::default(),
        );

        Fixture {
            provisioner,
            backend,
            device,
            relay,
            store,
            browser,
            resolved_tx,
            client_key,
        }
    }

    fn config() -> ProvisioningConfig {
        ProvisioningConfig {
            api_key: "test-api-key".to_string(),
            credentials: WifiCredentials {
                ssid: "home".to_string(),
                security: SecurityMode::WpaWpa2,
                password: "hunter22".to_string(),
            },
            device_ap_password: "XXXXXXXXXX".to_string(),
            country_code: "JP".to_string(),
        }
    }

    fn device_ap_visible(backend: &MockWifiBackend) {
        backend.set_scan_results(vec![WifiNetwork {
            ssid: "IRKitD45A".to_string(),
            mac: "aa:bb:cc:dd:ee:ff".to_string(),
            channel: 6,
            rssi: -50,
        }]);
    }

    fn confirmed_device_reachable(store: &MemoryPeripheralStore) {
        // The default mock door response names "mock-host"
        let mut peripheral = Peripheral::new("mock-host");
        peripheral.endpoint = Some(DeviceEndpoint::new(Ipv4Addr::new(10, 0, 0, 9), 80));
        store.add(peripheral);
    }

    async fn wait_for(observer: &RecordingObserver, phase: ProvisioningPhase) {
        for _ in 0..4000 {
            if observer.saw(phase) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("never reached phase {:?}", phase);
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_completes() {
        let f = fixture();
        device_ap_visible(&f.backend);
        confirmed_device_reachable(&f.store);

        // The door long-poll times out a few times before the device
        // reports in; these retries stay invisible to the caller
        for _ in 0..3 {
            f.relay.push_door_result(Err(TransportError::Status(408)));
        }

        let observer = Arc::new(RecordingObserver::default());
        f.provisioner.start(config(), observer.clone());

        wait_for(&observer, ProvisioningPhase::Complete).await;

        assert_eq!(
            observer.statuses(),
            vec![
                ProvisioningPhase::ObtainClientKey,
                ProvisioningPhase::ObtainDeviceKey,
                ProvisioningPhase::ScanForDeviceAp,
                ProvisioningPhase::ConnectDeviceAp,
                ProvisioningPhase::TransmitCredentials,
                ProvisioningPhase::WaitHomeNetwork,
                ProvisioningPhase::ConfirmConnectivity,
                ProvisioningPhase::Complete,
            ]
        );
        assert_eq!(observer.completions.load(Ordering::SeqCst), 1);
        assert!(observer.errors.lock().unwrap().is_empty());
        assert_eq!(f.relay.door_calls(), 4);

        // Credentials were transmitted once, with the leased device key
        let transmissions = f.device.wifi_calls();
        assert_eq!(transmissions.len(), 1);
        assert!(transmissions[0].contains("mock-devicekey"));

        // The confirmed device id landed in the registry and was persisted
        let peripheral = f.store.get("mock-host").unwrap();
        assert_eq!(peripheral.device_id.as_deref(), Some("mock-device"));
        assert!(f.store.persisted_snapshot().is_some());

        // Shared client key is available to the other components
        assert_eq!(
            f.client_key.read().await.as_deref(),
            Some("mock-clientkey")
        );

        // Local discovery was started for the confirmation
        assert!(f.browser.started());
        assert!(!f.provisioner.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_waits_for_local_discovery() {
        let f = fixture();
        device_ap_visible(&f.backend);

        let observer = Arc::new(RecordingObserver::default());
        f.provisioner.start(config(), observer.clone());

        wait_for(&observer, ProvisioningPhase::ConfirmConnectivity).await;
        assert_eq!(observer.completions.load(Ordering::SeqCst), 0);

        // The device shows up on the local network only now
        let mut peripheral = Peripheral::new("mock-host");
        peripheral.endpoint = Some(DeviceEndpoint::new(Ipv4Addr::new(10, 0, 0, 9), 80));
        f.store.add(peripheral.clone());
        f.resolved_tx.send(peripheral).unwrap();

        wait_for(&observer, ProvisioningPhase::Complete).await;
        assert_eq!(observer.completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_transmit_rolls_back_once() {
        let f = fixture();
        device_ap_visible(&f.backend);
        // Keep the transmission hanging so cancel lands mid-flight
        f.device.set_response_delay(Some(Duration::from_secs(10)));

        let observer = Arc::new(RecordingObserver::default());
        f.provisioner.start(config(), observer.clone());

        wait_for(&observer, ProvisioningPhase::TransmitCredentials).await;
        f.provisioner.cancel();
        wait_for(&observer, ProvisioningPhase::Cancelled).await;

        // No error surfaced, no completion; the session just ended
        assert!(observer.errors.lock().unwrap().is_empty());
        assert_eq!(observer.completions.load(Ordering::SeqCst), 0);

        // Rollback ran exactly once: temporary AP network removed, original
        // state (not associated) restored
        assert_eq!(f.backend.removed_networks().len(), 1);
        assert_eq!(f.backend.disconnect_count(), 1);

        // The in-flight transmission was abandoned; nothing after it ran
        assert_eq!(f.device.wifi_calls().len(), 1);
        assert!(!observer.saw(ProvisioningPhase::WaitHomeNetwork));
        assert!(!f.provisioner.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transmit_retry_budget_exhaustion_fails_and_rolls_back() {
        let f = fixture();
        device_ap_visible(&f.backend);
        for _ in 0..5 {
            f.device
                .push_wifi_result(Err(TransportError::Status(500)));
        }

        let observer = Arc::new(RecordingObserver::default());
        f.provisioner.start(config(), observer.clone());

        wait_for(&observer, ProvisioningPhase::Failed).await;

        assert_eq!(f.device.wifi_calls().len(), 5);
        let errors = observer.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Retry budget exceeded"));

        // Rollback removed the temporary network
        assert_eq!(f.backend.removed_networks().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_leaving_network_counts_as_delivered() {
        let f = fixture();
        device_ap_visible(&f.backend);
        confirmed_device_reachable(&f.store);
        f.device.push_wifi_result(Err(TransportError::ConnectionReset(
            "connection reset by peer".to_string(),
        )));

        let observer = Arc::new(RecordingObserver::default());
        f.provisioner.start(config(), observer.clone());

        wait_for(&observer, ProvisioningPhase::Complete).await;
        assert_eq!(f.device.wifi_calls().len(), 1);
        assert_eq!(observer.completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_timeout_fails_without_touching_network() {
        let f = fixture();
        // No scan results: the device AP never appears

        let observer = Arc::new(RecordingObserver::default());
        f.provisioner.start(config(), observer.clone());

        wait_for(&observer, ProvisioningPhase::Failed).await;

        let errors = observer.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Timed out"));

        // Nothing was joined yet, so rollback had nothing to restore
        assert!(f.backend.removed_networks().is_empty());
        assert_eq!(f.backend.disconnect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_attaches_to_active_session() {
        let f = fixture();
        device_ap_visible(&f.backend);
        confirmed_device_reachable(&f.store);
        // Slow the relay a little so the session is still active
        f.relay.set_response_delay(Some(Duration::from_millis(500)));

        let first = Arc::new(RecordingObserver::default());
        let second = Arc::new(RecordingObserver::default());

        let id_a = f.provisioner.start(config(), first.clone());
        let id_b = f.provisioner.start(config(), second.clone());
        assert_eq!(id_a, id_b);

        wait_for(&first, ProvisioningPhase::Complete).await;

        // Both observers saw the completion of the single session
        assert_eq!(first.completions.load(Ordering::SeqCst), 1);
        assert_eq!(second.completions.load(Ordering::SeqCst), 1);
        // Only one client key was requested
        assert_eq!(f.relay.client_key_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_without_session_is_a_no_op() {
        let f = fixture();
        f.provisioner.cancel();
        assert!(!f.provisioner.is_active());
    }
}
