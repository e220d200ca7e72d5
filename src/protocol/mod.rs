//! Wire formats: credential string and HTTP message bodies

pub mod credential;
pub mod messages;

pub use {
    credential::encode_credentials,
    messages::{
        ClientTokenResponse, ClientsResponse, DevicesResponse, DoorResponse, KeysResponse,
        ProbeInfo, RelayInbox, SignalMessage,
    },
};
