use crate::error::{DeviceError, Result};

/// Decodes a hex string, tolerating a `0x` prefix and an odd digit count.
pub fn decode(value: &str) -> Result<Vec<u8>> {
    let stripped = value.strip_prefix("0x").unwrap_or(value);
    if stripped.is_empty() {
        return Ok(Vec::new());
    }

    let padded = if stripped.len() % 2 != 0 {
        format!("0{stripped}")
    } else {
        stripped.to_owned()
    };

    ::hex::decode(&padded)
        .map_err(|err| DeviceError::invalid(format!("invalid hex '{stripped}': {err}")))
}

/// Big-endian integer bytes with leading zeros removed; zero encodes as `[0]`.
pub fn decode_quantity(value: &str) -> Result<Vec<u8>> {
    let bytes = decode(value)?;
    if bytes.is_empty() {
        return Ok(vec![0]);
    }

    let start = bytes
        .iter()
        .position(|&byte| byte != 0)
        .unwrap_or(bytes.len() - 1);
    Ok(bytes[start..].to_vec())
}

pub fn reversed(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().rev().copied().collect()
}
