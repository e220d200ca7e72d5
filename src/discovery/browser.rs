//! Local service discovery over multicast DNS

use std::net::Ipv4Addr;
use std::sync::Mutex;

use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use trait_variant::make;

use crate::core::error::{DiscoveryError, DiscoveryResult};

/// Stages of service discovery surfaced to the resolution listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceDiscoveryEvent {
    /// A service instance appeared; resolution is under way
    Added { name: String },
    /// A service instance disappeared from the network
    Removed { name: String },
    /// A service instance resolved to an address and port
    Resolved {
        name: String,
        address: Ipv4Addr,
        port: u16,
    },
}

/// Abstraction over the browse side of service discovery
///
/// `start` acquires the shared multicast resource and begins forwarding
/// events into `events`; `stop` releases both. The discovery queue is the
/// only caller and guarantees the two never overlap.
#[make(Send)]
pub trait ServiceBrowser: Sync + 'static {
    async fn start(&self, events: mpsc::Sender<ServiceDiscoveryEvent>) -> DiscoveryResult<()>;
    async fn stop(&self) -> DiscoveryResult<()>;
}

/// mdns-sd backed service browser
pub struct MdnsBrowser {
    service_type: String,
    daemon: Mutex<Option<ServiceDaemon>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl MdnsBrowser {
    /// Create a browser for the given service type, e.g.
    /// `"_irkit._tcp.local."`
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            daemon: Mutex::new(None),
            forwarder: Mutex::new(None),
        }
    }

    /// Instance name portion of an mDNS fullname
    fn instance_name(fullname: &str, service_type: &str) -> String {
        fullname
            .strip_suffix(service_type)
            .and_then(|name| name.strip_suffix('.'))
            .unwrap_or(fullname)
            .to_string()
    }

    fn first_ipv4(info: &mdns_sd::ServiceInfo) -> Option<Ipv4Addr> {
        info.get_addresses_v4().into_iter().next().copied()
    }

    async fn forward_events(
        receiver: mdns_sd::Receiver<ServiceEvent>,
        service_type: String,
        events: mpsc::Sender<ServiceDiscoveryEvent>,
    ) {
        while let Ok(event) = receiver.recv_async().await {
            let mapped = match event {
                ServiceEvent::ServiceFound(_, fullname) => Some(ServiceDiscoveryEvent::Added {
                    name: Self::instance_name(&fullname, &service_type),
                }),
                ServiceEvent::ServiceRemoved(_, fullname) => {
                    Some(ServiceDiscoveryEvent::Removed {
                        name: Self::instance_name(&fullname, &service_type),
                    })
                }
                ServiceEvent::ServiceResolved(info) => {
                    let name = Self::instance_name(info.get_fullname(), &service_type);
                    match Self::first_ipv4(&info) {
                        Some(address) => Some(ServiceDiscoveryEvent::Resolved {
                            name,
                            address,
                            port: info.get_port(),
                        }),
                        None => {
                            debug!("Service {} resolved without an IPv4 address", name);
                            None
                        }
                    }
                }
                _ => None,
            };

            if let Some(mapped) = mapped {
                if events.send(mapped).await.is_err() {
                    debug!("Discovery event channel closed, stopping forwarder");
                    return;
                }
            }
        }
    }
}

impl ServiceBrowser for MdnsBrowser {
    async fn start(&self, events: mpsc::Sender<ServiceDiscoveryEvent>) -> DiscoveryResult<()> {
        let daemon =
            ServiceDaemon::new().map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        let receiver = daemon
            .browse(&self.service_type)
            .map_err(|e| DiscoveryError::BrowseFailed(e.to_string()))?;

        debug!("Browsing for {}", self.service_type);

        let handle = tokio::spawn(Self::forward_events(
            receiver,
            self.service_type.clone(),
            events,
        ));

        if let Some(old) = self.daemon.lock().unwrap().replace(daemon) {
            warn!("Browser started while already running, shutting down old daemon");
            let _ = old.shutdown();
        }
        if let Some(old) = self.forwarder.lock().unwrap().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    async fn stop(&self) -> DiscoveryResult<()> {
        let daemon = self.daemon.lock().unwrap().take();
        if let Some(daemon) = daemon {
            debug!("Stopping browse for {}", self.service_type);
            if let Err(e) = daemon.stop_browse(&self.service_type) {
                warn!("Failed to stop browsing: {}", e);
            }
            let _ = daemon.shutdown();
        }

        // The forwarder drains by itself once the daemon is gone
        self.forwarder.lock().unwrap().take();
        Ok(())
    }
}

/// Mock service browser for testing
#[derive(Default)]
pub struct MockServiceBrowser {
    state: Mutex<MockBrowserState>,
}

#[derive(Default)]
struct MockBrowserState {
    started: bool,
    operations: Vec<bool>,
    op_delay: Option<std::time::Duration>,
    inflight: usize,
    max_inflight: usize,
    events_tx: Option<mpsc::Sender<ServiceDiscoveryEvent>>,
}

impl MockServiceBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every start/stop operation; with a paused clock this keeps an
    /// operation "running" while further intents queue up
    pub fn set_op_delay(&self, delay: Option<std::time::Duration>) {
        self.state.lock().unwrap().op_delay = delay;
    }

    pub fn started(&self) -> bool {
        self.state.lock().unwrap().started
    }

    /// start/stop operations actually executed, in order
    pub fn operations(&self) -> Vec<bool> {
        self.state.lock().unwrap().operations.clone()
    }

    /// Highest number of concurrently running operations observed
    pub fn max_inflight(&self) -> usize {
        self.state.lock().unwrap().max_inflight
    }

    /// Emit a resolve event as the running browse would
    pub async fn resolve(&self, name: &str, address: Ipv4Addr, port: u16) {
        let tx = self.state.lock().unwrap().events_tx.clone();
        if let Some(tx) = tx {
            let _ = tx
                .send(ServiceDiscoveryEvent::Resolved {
                    name: name.to_string(),
                    address,
                    port,
                })
                .await;
        }
    }

    /// Emit a removal event as the running browse would
    pub async fn remove(&self, name: &str) {
        let tx = self.state.lock().unwrap().events_tx.clone();
        if let Some(tx) = tx {
            let _ = tx
                .send(ServiceDiscoveryEvent::Removed {
                    name: name.to_string(),
                })
                .await;
        }
    }

    async fn run_op(&self, start: bool, events: Option<mpsc::Sender<ServiceDiscoveryEvent>>) {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.inflight += 1;
            state.max_inflight = state.max_inflight.max(state.inflight);
            state.op_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.inflight -= 1;
        state.started = start;
        state.operations.push(start);
        state.events_tx = events;
    }
}

impl ServiceBrowser for MockServiceBrowser {
    async fn start(&self, events: mpsc::Sender<ServiceDiscoveryEvent>) -> DiscoveryResult<()> {
        self.run_op(true, Some(events)).await;
        Ok(())
    }

    async fn stop(&self) -> DiscoveryResult<()> {
        self.run_op(false, None).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_name_extraction() {
        assert_eq!(
            MdnsBrowser::instance_name("irkitd45a._irkit._tcp.local.", "_irkit._tcp.local."),
            "irkitd45a"
        );
        // Unexpected shapes fall through untouched
        assert_eq!(
            MdnsBrowser::instance_name("plain-name", "_irkit._tcp.local."),
            "plain-name"
        );
    }

    #[tokio::test]
    async fn test_mock_browser_records_operations() {
        let browser = MockServiceBrowser::new();
        let (tx, mut rx) = mpsc::channel(8);

        browser.start(tx).await.unwrap();
        assert!(browser.started());

        browser
            .resolve("irkitd45a", Ipv4Addr::new(10, 0, 0, 3), 80)
            .await;
        assert!(matches!(
            rx.recv().await,
            Some(ServiceDiscoveryEvent::Resolved { name, .. }) if name == "irkitd45a"
        ));

        browser.stop().await.unwrap();
        assert!(!browser.started());
        assert_eq!(browser.operations(), vec![true, false]);
    }
}
