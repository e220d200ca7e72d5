//! Credential wire format for the device `/wifi` endpoint
//!
//! The device expects its target network credentials as a single
//! slash-separated, hex-armored, CRC8-checksummed string. The checksum is
//! computed over fixed-width byte windows regardless of the real input
//! lengths: positions past the end of an input still advance the CRC shift
//! register, just without an XOR contribution, and positions past the
//! window are silently dropped. Device firmware validates exactly this, so
//! the windowing must not be "fixed" here.

use tracing::warn;

use crate::core::{
    error::EncodeError,
    types::{RegulatoryDomain, SecurityMode, WifiCredentials},
};

/// CRC8 polynomial used by the device firmware
const CRC8_POLY: u8 = 0x31;

/// Fixed CRC windows: SSID, password, device key
const SSID_WINDOW: usize = 33;
const PASSWORD_WINDOW: usize = 64;
const DEVICE_KEY_WINDOW: usize = 33;

/// WEP keys of these raw lengths are hex-armored before encoding
const WEP_KEY_LENGTHS: [usize; 2] = [5, 13];

/// Advance the CRC over one byte
fn crc8_byte(mut crc: u8, byte: u8) -> u8 {
    crc ^= byte;
    for _ in 0..8 {
        if crc & 0x80 != 0 {
            crc = (crc << 1) ^ CRC8_POLY;
        } else {
            crc <<= 1;
        }
    }
    crc
}

/// Advance the CRC over a fixed-width window of `bytes`
///
/// Positions beyond `bytes` shift without XOR; positions of `bytes` beyond
/// `width` contribute nothing at all.
fn crc8_window(mut crc: u8, bytes: &[u8], width: usize) -> u8 {
    for i in 0..width {
        crc = crc8_byte(crc, bytes.get(i).copied().unwrap_or(0));
    }
    crc
}

/// Password bytes as they enter both the hex field and the checksum
fn armored_password(credentials: &WifiCredentials) -> Vec<u8> {
    let raw = credentials.password.as_bytes();
    if credentials.security == SecurityMode::Wep && WEP_KEY_LENGTHS.contains(&raw.len()) {
        hex::encode(raw).into_bytes()
    } else {
        raw.to_vec()
    }
}

/// Encode network credentials into the device credential string
///
/// `device_key` is the session-scoped key obtained from the cloud relay,
/// passed through verbatim.
pub fn encode_credentials(
    credentials: &WifiCredentials,
    device_key: &str,
    domain: RegulatoryDomain,
) -> Result<String, EncodeError> {
    match credentials.security {
        SecurityMode::Open if !credentials.password.is_empty() => {
            return Err(EncodeError::UnexpectedPassword);
        }
        SecurityMode::Wep if credentials.password.is_empty() => {
            return Err(EncodeError::PasswordRequired("WEP"));
        }
        SecurityMode::WpaWpa2 if credentials.password.is_empty() => {
            return Err(EncodeError::PasswordRequired("WPA/WPA2"));
        }
        _ => {}
    }

    let ssid = credentials.ssid.as_bytes();
    let password = armored_password(credentials);
    let key = device_key.as_bytes();

    // Inputs wider than their checksum window diverge silently from a
    // full-input encoding; the firmware shares the limitation.
    if ssid.len() > SSID_WINDOW || password.len() > PASSWORD_WINDOW || key.len() > DEVICE_KEY_WINDOW
    {
        warn!(
            ssid_len = ssid.len(),
            password_len = password.len(),
            key_len = key.len(),
            "Credential input exceeds its checksum window; encoding truncates its contribution"
        );
    }

    let mut crc = crc8_byte(0x00, credentials.security.code());
    crc = crc8_window(crc, ssid, SSID_WINDOW);
    crc = crc8_window(crc, &password, PASSWORD_WINDOW);
    crc = crc8_byte(crc, 0x01); // credentials present
    crc = crc8_byte(crc, 0x00); // no previously stored credentials
    crc = crc8_window(crc, key, DEVICE_KEY_WINDOW);

    Ok(format!(
        "{}/{}/{}/{}/{}//////{:x}",
        credentials.security.code(),
        hex::encode(ssid),
        hex::encode(&password),
        device_key,
        domain as u8,
        crc
    ))
}
