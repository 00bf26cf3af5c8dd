/// Network parameters the host needs before talking to the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CoinInfo {
    /// Name the firmware expects in `coin_name`.
    pub name: &'static str,
    pub shortcut: &'static str,
    /// Smallest relayable output value, in the coin's base unit.
    pub dust_limit: u64,
    /// Whether the firmware accepts witness inputs for this coin.
    pub segwit: bool,
}

pub const KNOWN_COINS: &[CoinInfo] = &[
    CoinInfo {
        name: "Bitcoin",
        shortcut: "BTC",
        dust_limit: 546,
        segwit: true,
    },
    CoinInfo {
        name: "Testnet",
        shortcut: "TEST",
        dust_limit: 546,
        segwit: true,
    },
    CoinInfo {
        name: "Regtest",
        shortcut: "REGTEST",
        dust_limit: 546,
        segwit: true,
    },
    CoinInfo {
        name: "Bcash",
        shortcut: "BCH",
        dust_limit: 546,
        segwit: false,
    },
    CoinInfo {
        name: "Litecoin",
        shortcut: "LTC",
        dust_limit: 54_600,
        segwit: true,
    },
    CoinInfo {
        name: "Dogecoin",
        shortcut: "DOGE",
        dust_limit: 10_000_000,
        segwit: false,
    },
    CoinInfo {
        name: "Dash",
        shortcut: "DASH",
        dust_limit: 5_460,
        segwit: false,
    },
    CoinInfo {
        name: "Zcash",
        shortcut: "ZEC",
        dust_limit: 546,
        segwit: false,
    },
];

/// Case-insensitive lookup by firmware coin name or ticker.
pub fn coin_by_name(name: &str) -> Option<&'static CoinInfo> {
    let name = name.trim();
    KNOWN_COINS.iter().find(|coin| {
        coin.name.eq_ignore_ascii_case(name) || coin.shortcut.eq_ignore_ascii_case(name)
    })
}
