//! Error types for the device onboarding service

use thiserror::Error;

use super::types::ProvisioningPhase;

/// Result type for WiFi backend operations
pub type WifiResult<T> = Result<T, WifiError>;

/// Result type for HTTP transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for service discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Result type for repository operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for signal dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Result type for provisioning operations
pub type ProvisioningResult<T> = Result<T, ProvisioningError>;

/// Errors related to WiFi backend operations
#[derive(Error, Debug, Clone)]
pub enum WifiError {
    #[error("WiFi scan failed: {0}")]
    ScanFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Network interface error: {0}")]
    InterfaceError(String),

    #[error("wpa_supplicant error: {0}")]
    WpaSupplicantError(String),
}

/// Errors related to the HTTP transports (device-local and cloud relay)
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status: {0}")]
    Status(u16),

    #[error("Empty response body")]
    EmptyBody,

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Connection dropped by peer: {0}")]
    ConnectionReset(String),
}

impl TransportError {
    /// Whether a retry of the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            TransportError::Status(code) => *code == 408 || *code >= 500,
            TransportError::EmptyBody => true,
            TransportError::Malformed(_) => false,
            TransportError::ConnectionReset(_) => true,
        }
    }
}

/// Errors related to credential encoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Password required for security mode {0}")]
    PasswordRequired(&'static str),

    #[error("Password must be empty for an open network")]
    UnexpectedPassword,
}

/// Errors related to local service discovery
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    #[error("mDNS daemon error: {0}")]
    Daemon(String),

    #[error("Browse failed: {0}")]
    BrowseFailed(String),
}

/// Errors related to the injected repositories
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to signal dispatch
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No peripheral known for device id {0}")]
    UnknownDevice(String),

    #[error("No client key available for relayed delivery")]
    MissingClientKey,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Dispatch queue closed")]
    QueueClosed,
}

/// Errors surfaced by the provisioning state machine
#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("Transient network error: {0}")]
    Transient(String),

    #[error("Authentication failed for network {0}")]
    Authentication(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Retry budget exceeded while {phase} after {attempts} attempts")]
    RetryBudgetExceeded {
        phase: ProvisioningPhase,
        attempts: u32,
    },

    #[error("Timed out while {phase}")]
    Timeout { phase: ProvisioningPhase },

    #[error("Session cancelled")]
    Cancelled,

    #[error("Backend error: {0}")]
    Backend(#[from] WifiError),
}

impl ProvisioningError {
    /// Classify a transport failure against the phase's retry taxonomy
    pub fn from_transport(error: TransportError) -> Self {
        match error {
            TransportError::EmptyBody => ProvisioningError::Protocol("empty response".into()),
            TransportError::Malformed(msg) => ProvisioningError::Protocol(msg),
            other => ProvisioningError::Transient(other.to_string()),
        }
    }
}
