//! Coalescing queue serializing discovery start/stop requests
//!
//! The multicast resource behind discovery tolerates exactly one
//! operation at a time, so intents are queued and processed by a single
//! in-flight worker. The queue is not FIFO in the strict sense: redundant
//! requests are dropped and contradictory intermediate requests collapse,
//! leaving at most two pending entries, so the processed end state always
//! equals the most recently requested one.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::discovery::browser::{ServiceBrowser, ServiceDiscoveryEvent};

#[derive(Debug, Default)]
struct IntentQueue {
    entries: VecDeque<bool>,
    busy: bool,
}

/// Serialized, coalescing access to a [`ServiceBrowser`]
pub struct DiscoveryQueue<B> {
    browser: Arc<B>,
    events_tx: mpsc::Sender<ServiceDiscoveryEvent>,
    state: Arc<Mutex<IntentQueue>>,
}

impl<B: ServiceBrowser> DiscoveryQueue<B> {
    /// Create a queue feeding discovery events into `events_tx`
    pub fn new(browser: Arc<B>, events_tx: mpsc::Sender<ServiceDiscoveryEvent>) -> Self {
        Self {
            browser,
            events_tx,
            state: Arc::new(Mutex::new(IntentQueue::default())),
        }
    }

    /// Request that discovery should (not) be running
    ///
    /// Returns immediately; the steady state eventually reached equals the
    /// intent of the last call.
    pub async fn request(&self, start: bool) {
        let mut queue = self.state.lock().await;

        // Redundant request, nothing to do
        if queue.entries.back() == Some(&start) {
            return;
        }

        // Collapse contradictory intermediate requests
        while queue.entries.len() >= 2 && queue.entries.back() == Some(&!start) {
            queue.entries.pop_back();
        }
        if queue.entries.back() == Some(&start) {
            return;
        }

        let was_empty = queue.entries.is_empty();
        queue.entries.push_back(start);
        debug!(intent = start, pending = queue.entries.len(), "Discovery intent queued");

        if was_empty && !queue.busy {
            queue.busy = true;
            drop(queue);
            self.spawn_worker();
        }
    }

    /// One worker drains the queue; only one browse operation is in
    /// flight at any time
    fn spawn_worker(&self) {
        let browser = self.browser.clone();
        let events_tx = self.events_tx.clone();
        let state = self.state.clone();

        tokio::spawn(async move {
            loop {
                let intent = {
                    let mut queue = state.lock().await;
                    match queue.entries.pop_front() {
                        Some(intent) => intent,
                        None => {
                            queue.busy = false;
                            return;
                        }
                    }
                };

                let result = if intent {
                    browser.start(events_tx.clone()).await
                } else {
                    browser.stop().await
                };

                if let Err(e) = result {
                    warn!(intent, "Discovery operation failed: {}", e);
                }
            }
        });
    }

    #[cfg(test)]
    async fn pending(&self) -> Vec<bool> {
        self.state.lock().await.entries.iter().copied().collect()
    }
}
