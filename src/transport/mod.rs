//! HTTP transport layer: device-local API and cloud relay API

pub mod device;
pub mod mock_transport;
pub mod relay;

pub use {
    device::{DeviceTransport, HttpDeviceClient},
    mock_transport::{MockDeviceTransport, MockRelayTransport},
    relay::{HttpRelayClient, RelayTransport, fetch_inbox, wait_for_door},
};
