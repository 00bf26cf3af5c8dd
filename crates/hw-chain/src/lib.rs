//! Coin parameters and derivation-path helpers shared by the hw-core crates.

pub mod bip32;
pub mod coin;

pub use bip32::{is_segwit_path, parse_bip32_path, Bip32Error, HARDENED};
pub use coin::{coin_by_name, CoinInfo, KNOWN_COINS};
