//! Injected repositories for peripherals and signals
//!
//! Durable persistence belongs to the embedding application; the core only
//! relies on this get/add/remove/save/load surface plus the mutators the
//! discovery listener and provisioning session need.

use std::{collections::HashMap, sync::Mutex};

use tracing::debug;

use crate::core::{
    error::StoreResult,
    types::{DeviceEndpoint, Peripheral, Signal},
};

/// Repository of known peripherals
pub trait PeripheralStore: Send + Sync + 'static {
    /// Look up a peripheral by hostname
    fn get(&self, hostname: &str) -> Option<Peripheral>;

    /// All known peripherals
    fn list(&self) -> Vec<Peripheral>;

    /// Add a peripheral; replaces an existing record with the same hostname
    fn add(&self, peripheral: Peripheral);

    /// Remove a peripheral by hostname
    fn remove(&self, hostname: &str);

    /// Find the peripheral routable for a device id
    fn find_by_device_id(&self, device_id: &str) -> Option<Peripheral>;

    /// Store or clear the resolved local endpoint of a peripheral
    fn set_endpoint(&self, hostname: &str, endpoint: Option<DeviceEndpoint>);

    /// Assign a device id. Only one record may route a device id; the most
    /// recently assigned record wins, older holders lose the id.
    fn assign_device_id(&self, hostname: &str, device_id: &str);

    /// Set the duplicate-fetch guard for a peripheral
    fn set_fetching_device_id(&self, hostname: &str, fetching: bool);

    /// Store fetched model information
    fn set_model(&self, hostname: &str, model: &str, firmware: &str);

    /// Persist the current peripheral list
    fn save(&self) -> StoreResult<()>;

    /// Restore the peripheral list from the last persisted state
    fn load(&self) -> StoreResult<()>;
}

/// Repository of learned signals
pub trait SignalStore: Send + Sync + 'static {
    fn list(&self) -> Vec<Signal>;
    fn add(&self, signal: Signal);
    fn remove(&self, index: usize);
    fn save(&self) -> StoreResult<()>;
    fn load(&self) -> StoreResult<()>;
}

/// In-memory peripheral repository
///
/// Persists by snapshotting to a JSON string, which is also what the
/// tests inspect. An application wanting durable storage supplies its own
/// `PeripheralStore`.
#[derive(Debug, Default)]
pub struct MemoryPeripheralStore {
    peripherals: Mutex<HashMap<String, Peripheral>>,
    persisted: Mutex<Option<String>>,
}

impl MemoryPeripheralStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last persisted snapshot, if `save` has been called
    pub fn persisted_snapshot(&self) -> Option<String> {
        self.persisted.lock().unwrap().clone()
    }
}

impl PeripheralStore for MemoryPeripheralStore {
    fn get(&self, hostname: &str) -> Option<Peripheral> {
        self.peripherals.lock().unwrap().get(hostname).cloned()
    }

    fn list(&self) -> Vec<Peripheral> {
        self.peripherals.lock().unwrap().values().cloned().collect()
    }

    fn add(&self, peripheral: Peripheral) {
        self.peripherals
            .lock()
            .unwrap()
            .insert(peripheral.hostname.clone(), peripheral);
    }

    fn remove(&self, hostname: &str) {
        self.peripherals.lock().unwrap().remove(hostname);
    }

    fn find_by_device_id(&self, device_id: &str) -> Option<Peripheral> {
        self.peripherals
            .lock()
            .unwrap()
            .values()
            .find(|p| p.device_id.as_deref() == Some(device_id))
            .cloned()
    }

    fn set_endpoint(&self, hostname: &str, endpoint: Option<DeviceEndpoint>) {
        if let Some(peripheral) = self.peripherals.lock().unwrap().get_mut(hostname) {
            peripheral.endpoint = endpoint;
        }
    }

    fn assign_device_id(&self, hostname: &str, device_id: &str) {
        let mut peripherals = self.peripherals.lock().unwrap();

        // Most recently assigned record wins command routing
        for (name, peripheral) in peripherals.iter_mut() {
            if name != hostname && peripheral.device_id.as_deref() == Some(device_id) {
                debug!(
                    old = %name,
                    new = %hostname,
                    "Reassigning device id to newer peripheral"
                );
                peripheral.device_id = None;
            }
        }

        if let Some(peripheral) = peripherals.get_mut(hostname) {
            peripheral.device_id = Some(device_id.to_string());
        }
    }

    fn set_fetching_device_id(&self, hostname: &str, fetching: bool) {
        if let Some(peripheral) = self.peripherals.lock().unwrap().get_mut(hostname) {
            peripheral.is_fetching_device_id = fetching;
        }
    }

    fn set_model(&self, hostname: &str, model: &str, firmware: &str) {
        if let Some(peripheral) = self.peripherals.lock().unwrap().get_mut(hostname) {
            peripheral.model_name = Some(model.to_string());
            peripheral.firmware_version = Some(firmware.to_string());
        }
    }

    fn save(&self) -> StoreResult<()> {
        let mut peripherals: Vec<Peripheral> =
            self.peripherals.lock().unwrap().values().cloned().collect();
        peripherals.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        let snapshot = serde_json::to_string(&peripherals)?;
        *self.persisted.lock().unwrap() = Some(snapshot);
        Ok(())
    }

    fn load(&self) -> StoreResult<()> {
        let snapshot = self.persisted.lock().unwrap().clone();
        if let Some(snapshot) = snapshot {
            let peripherals: Vec<Peripheral> = serde_json::from_str(&snapshot)?;
            let mut map = self.peripherals.lock().unwrap();
            map.clear();
            for peripheral in peripherals {
                map.insert(peripheral.hostname.clone(), peripheral);
            }
        }
        Ok(())
    }
}

/// In-memory signal repository
#[derive(Debug, Default)]
pub struct MemorySignalStore {
    signals: Mutex<Vec<Signal>>,
    persisted: Mutex<Option<String>>,
}

impl MemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SignalStore for MemorySignalStore {
    fn list(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }

    fn add(&self, signal: Signal) {
        self.signals.lock().unwrap().push(signal);
    }

    fn remove(&self, index: usize) {
        let mut signals = self.signals.lock().unwrap();
        if index < signals.len() {
            signals.remove(index);
        }
    }

    fn save(&self) -> StoreResult<()> {
        let snapshot = serde_json::to_string(&*self.signals.lock().unwrap())?;
        *self.persisted.lock().unwrap() = Some(snapshot);
        Ok(())
    }

    fn load(&self) -> StoreResult<()> {
        let snapshot = self.persisted.lock().unwrap().clone();
        if let Some(snapshot) = snapshot {
            *self.signals.lock().unwrap() = serde_json::from_str(&snapshot)?;
        }
        Ok(())
    }
}
