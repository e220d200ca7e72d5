//! Device Onboarding Service
//!
//! Onboards headless IR transceiver devices onto a home wireless network,
//! rediscovers them over mDNS afterwards, and serializes signal delivery
//! to them:
//! - Provisioning state machine with per-phase timeouts, retries and
//!   rollback
//! - Coalescing discovery queue and service resolution listener
//! - Strict-FIFO, single-flight signal dispatch with local-first delivery

pub mod backend;
pub mod config;
pub mod core;
pub mod discovery;
pub mod dispatch;
pub mod protocol;
pub mod transport;

pub use crate::core::{
    error::{DiscoveryError, DispatchError, EncodeError, ProvisioningError, StoreError,
        TransportError, WifiError},
    provisioner::{Provisioner, ProvisioningConfig, ProvisioningObserver},
    registry::{MemoryPeripheralStore, MemorySignalStore, PeripheralStore, SignalStore},
    service::OnboardingService,
    types::{DeviceEndpoint, Peripheral, ProvisioningPhase, RegulatoryDomain, SecurityMode,
        SessionId, Signal, WifiCredentials, WifiNetwork},
};
