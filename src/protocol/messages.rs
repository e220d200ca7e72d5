//! HTTP message bodies for the device-local and cloud relay APIs

use serde::{Deserialize, Serialize};

use crate::core::types::Signal;

/// Body of device `POST /keys` responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientTokenResponse {
    pub clienttoken: String,
}

/// An IR signal as it appears on the wire (`GET/POST /messages`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalMessage {
    pub format: String,
    pub freq: u16,
    pub data: Vec<u32>,
}

impl SignalMessage {
    /// Attach a device id, turning a wire message into a domain signal
    pub fn into_signal(self, device_id: impl Into<String>) -> Signal {
        Signal {
            device_id: device_id.into(),
            format: self.format,
            freq: self.freq,
            data: self.data,
        }
    }
}

impl From<&Signal> for SignalMessage {
    fn from(signal: &Signal) -> Self {
        Self {
            format: signal.format.clone(),
            freq: signal.freq,
            data: signal.data.clone(),
        }
    }
}

/// Body of relay `POST /1/clients` responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientsResponse {
    pub clientkey: String,
}

/// Body of relay `POST /1/keys` responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeysResponse {
    pub deviceid: String,
    pub clientkey: String,
}

/// Body of relay `POST /1/devices` responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DevicesResponse {
    pub devicekey: String,
    pub deviceid: String,
}

/// Body of relay `POST /1/door` responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DoorResponse {
    #[serde(default)]
    pub hostname: Option<String>,
}

/// Body of relay `GET /1/messages` responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayInbox {
    pub message: SignalMessage,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub deviceid: Option<String>,
}

/// Information gathered from the device connectivity probe (`GET /`)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProbeInfo {
    /// Raw `Server` header, e.g. `"IRKit/3.0.0.0.g85190b2"`
    pub server: Option<String>,
}

impl ProbeInfo {
    /// Split the `Server` header into model name and firmware version
    pub fn model(&self) -> Option<(String, String)> {
        let server = self.server.as_deref()?;
        let (model, firmware) = server.split_once('/')?;
        if model.is_empty() || firmware.is_empty() {
            return None;
        }
        Some((model.to_string(), firmware.to_string()))
    }
}
