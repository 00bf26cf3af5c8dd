use thiserror::Error;

/// The hardened-key bit flag defined by BIP-32 (2^31).
pub const HARDENED: u32 = 0x8000_0000;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid BIP32 path: {0}")]
pub struct Bip32Error(pub String);

/// Parses a BIP-32 derivation path string into child-key indices.
///
/// The path may begin with `"m/"`. Each component is a decimal integer
/// optionally followed by `'`, `h` or `H` to denote a hardened child.
///
/// | Input example         | Parsed indices                               |
/// |-----------------------|----------------------------------------------|
/// | `"m/44'/60'/0'/0/0"`  | `[0x8000002c, 0x8000003c, 0x80000000, 0, 0]` |
/// | `"44h/1/2H"`          | `[0x8000002c, 1, 0x80000002]`                |
/// | `"m"`                 | `[]`                                         |
pub fn parse_bip32_path(path: &str) -> Result<Vec<u32>, Bip32Error> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(Bip32Error("path is empty".to_string()));
    }

    let body = if trimmed == "m" {
        return Ok(Vec::new());
    } else if let Some(rest) = trimmed.strip_prefix("m/") {
        rest
    } else {
        trimmed
    };

    let mut result = Vec::new();
    for segment in body.split('/') {
        if segment.is_empty() {
            return Err(Bip32Error(format!("empty segment in '{path}'")));
        }

        let hardened = segment.ends_with('\'') || segment.ends_with('h') || segment.ends_with('H');
        let number_str = if hardened {
            &segment[..segment.len() - 1]
        } else {
            segment
        };

        let value = number_str
            .parse::<u32>()
            .map_err(|_| Bip32Error(format!("invalid segment '{segment}' in '{path}'")))?;
        if value >= HARDENED {
            return Err(Bip32Error(format!(
                "segment '{segment}' is out of range (must be < 2^31)"
            )));
        }

        result.push(if hardened { value | HARDENED } else { value });
    }

    Ok(result)
}

pub fn unharden(index: u32) -> u32 {
    index & !HARDENED
}

/// Whether the path's purpose implies a witness script, for which the device
/// needs the spent amount of the input.
pub fn is_segwit_path(path: &[u32]) -> bool {
    let Some(purpose) = path.first().copied() else {
        return false;
    };
    if purpose & HARDENED == 0 {
        return false;
    }
    match unharden(purpose) {
        49 | 84 | 86 => true,
        // BIP-48 multisig: script index 1 (p2sh-p2wsh) and 2 (p2wsh)
        48 => matches!(path.get(3).copied().map(unharden), Some(1 | 2)),
        _ => false,
    }
}
