//! Connectivity watcher resolving association events against a target

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::core::{
    error::{WifiError, WifiResult},
    types::LinkEvent,
};

/// Two authentication failures within this window resolve as a failure
const AUTH_FAILURE_WINDOW: Duration = Duration::from_secs(3);

/// How a target network identity is matched against event SSIDs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMatcher {
    Exact(String),
    Prefix(String),
}

impl NetworkMatcher {
    pub fn matches(&self, ssid: &str) -> bool {
        match self {
            NetworkMatcher::Exact(target) => ssid == target,
            NetworkMatcher::Prefix(prefix) => ssid.starts_with(prefix.as_str()),
        }
    }
}

/// Resolution of a connectivity watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The target network associated with a usable address
    Connected { ssid: String, address: Ipv4Addr },
    /// Authentication against the target failed twice in short succession
    AuthenticationFailed,
    /// The deadline elapsed without a resolution
    TimedOut,
}

/// Watches raw association events for a target network
///
/// `wait` consumes the watcher and resolves exactly once; events arriving
/// concurrently with the deadline cannot produce a second outcome.
/// Subscribe to the backend before initiating the connection, then hand
/// the receiver here.
pub struct ConnectivityWatcher {
    events: broadcast::Receiver<LinkEvent>,
    matcher: NetworkMatcher,
    deadline: Option<Duration>,
}

impl ConnectivityWatcher {
    /// Create a watcher; `deadline` of `None` disables the timeout
    pub fn new(
        events: broadcast::Receiver<LinkEvent>,
        matcher: NetworkMatcher,
        deadline: Option<Duration>,
    ) -> Self {
        Self {
            events,
            matcher,
            deadline,
        }
    }

    /// Wait for the target to resolve
    pub async fn wait(mut self) -> WifiResult<WatchOutcome> {
        let deadline = self.deadline.map(|d| Instant::now() + d);
        let mut first_auth_failure: Option<Instant> = None;

        loop {
            let event = match deadline {
                Some(at) => {
                    tokio::select! {
                        event = self.events.recv() => event,
                        _ = sleep_until(at) => return Ok(WatchOutcome::TimedOut),
                    }
                }
                None => self.events.recv().await,
            };

            match event {
                Ok(LinkEvent::Associated {
                    ssid,
                    address: Some(address),
                }) if self.matcher.matches(&ssid) && !address.is_unspecified() => {
                    debug!("Target network {} associated at {}", ssid, address);
                    return Ok(WatchOutcome::Connected { ssid, address });
                }
                Ok(LinkEvent::AuthenticationFailed { ssid }) if self.matcher.matches(&ssid) => {
                    let now = Instant::now();
                    match first_auth_failure {
                        Some(first) if now.duration_since(first) <= AUTH_FAILURE_WINDOW => {
                            debug!("Repeated authentication failure for {}", ssid);
                            return Ok(WatchOutcome::AuthenticationFailed);
                        }
                        _ => first_auth_failure = Some(now),
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(WifiError::BackendUnavailable(
                        "link event channel closed".into(),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn associated(ssid: &str, address: [u8; 4]) -> LinkEvent {
        LinkEvent::Associated {
            ssid: ssid.to_string(),
            address: Some(Ipv4Addr::from(address)),
        }
    }

    #[tokio::test]
    async fn test_exact_match_resolves_connected() {
        let (tx, rx) = broadcast::channel(8);
        let watcher = ConnectivityWatcher::new(
            rx,
            NetworkMatcher::Exact("home".to_string()),
            Some(Duration::from_secs(30)),
        );

        tx.send(associated("neighbor", [10, 0, 0, 7])).unwrap();
        tx.send(associated("home", [10, 0, 0, 8])).unwrap();

        let outcome = watcher.wait().await.unwrap();
        assert_eq!(
            outcome,
            WatchOutcome::Connected {
                ssid: "home".to_string(),
                address: Ipv4Addr::new(10, 0, 0, 8),
            }
        );
    }

    #[tokio::test]
    async fn test_prefix_match() {
        let (tx, rx) = broadcast::channel(8);
        let watcher = ConnectivityWatcher::new(
            rx,
            NetworkMatcher::Prefix("IRKit".to_string()),
            None,
        );

        tx.send(associated("IRKitD45A", [192, 168, 1, 2])).unwrap();

        let outcome = watcher.wait().await.unwrap();
        assert!(matches!(outcome, WatchOutcome::Connected { ssid, .. } if ssid == "IRKitD45A"));
    }

    #[tokio::test]
    async fn test_unspecified_address_is_not_connected() {
        let (tx, rx) = broadcast::channel(8);
        let watcher = ConnectivityWatcher::new(
            rx,
            NetworkMatcher::Exact("home".to_string()),
            Some(Duration::from_millis(50)),
        );

        tx.send(associated("home", [0, 0, 0, 0])).unwrap();

        let outcome = watcher.wait().await.unwrap();
        assert_eq!(outcome, WatchOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_auth_failure_within_window() {
        let (tx, rx) = broadcast::channel(8);
        let watcher = ConnectivityWatcher::new(
            rx,
            NetworkMatcher::Exact("home".to_string()),
            Some(Duration::from_secs(30)),
        );

        tx.send(LinkEvent::AuthenticationFailed {
            ssid: "home".to_string(),
        })
        .unwrap();
        tx.send(LinkEvent::AuthenticationFailed {
            ssid: "home".to_string(),
        })
        .unwrap();

        let outcome = watcher.wait().await.unwrap();
        assert_eq!(outcome, WatchOutcome::AuthenticationFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spread_auth_failures_do_not_resolve() {
        let (tx, rx) = broadcast::channel(8);
        let handle = tokio::spawn(
            ConnectivityWatcher::new(
                rx,
                NetworkMatcher::Exact("home".to_string()),
                Some(Duration::from_secs(10)),
            )
            .wait(),
        );

        tx.send(LinkEvent::AuthenticationFailed {
            ssid: "home".to_string(),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        tx.send(LinkEvent::AuthenticationFailed {
            ssid: "home".to_string(),
        })
        .unwrap();

        // Second failure falls outside the 3s window, so only the deadline
        // can resolve the watch
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, WatchOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_events() {
        let (_tx, rx) = broadcast::channel::<LinkEvent>(8);
        let watcher = ConnectivityWatcher::new(
            rx,
            NetworkMatcher::Exact("home".to_string()),
            Some(Duration::from_secs(30)),
        );

        let outcome = watcher.wait().await.unwrap();
        assert_eq!(outcome, WatchOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simultaneous_event_and_deadline_yield_one_outcome() {
        let (tx, rx) = broadcast::channel(8);
        let deadline = Duration::from_secs(5);
        let handle = tokio::spawn(
            ConnectivityWatcher::new(rx, NetworkMatcher::Exact("home".to_string()), Some(deadline))
                .wait(),
        );

        // Let the watcher arm its deadline, then make the event arrive at
        // the exact expiry instant
        tokio::time::sleep(Duration::from_secs(5)).await;
        let _ = tx.send(associated("home", [10, 0, 0, 8]));

        // Either resolution is acceptable; there must be exactly one
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            WatchOutcome::Connected { .. } | WatchOutcome::TimedOut
        ));
    }
}
