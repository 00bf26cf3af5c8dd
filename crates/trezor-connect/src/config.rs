//! Session configuration, loadable from JSON.

use serde::Deserialize;
use tracing::debug;

use crate::bitcoin::PrevHashOrder;
use crate::error::{DeviceError, Result};
use crate::link::Link;
use crate::registry::MessageRegistry;
use crate::session::{DeviceSession, DEFAULT_ENTROPY_LEN};
use crate::transport::{Transport, UdpLink, DEFAULT_EMULATOR_ADDRESS};

const DEFAULT_USB_INTERFACE: u8 = 0;
const DEFAULT_USB_TIMEOUT_MS: u64 = 500;

/// Which link a session talks over.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    Udp {
        #[serde(default = "default_udp_address")]
        address: String,
    },
    Usb {
        #[serde(default = "default_vendor_id")]
        vendor_id: u16,
        #[serde(default = "default_product_id")]
        product_id: u16,
        #[serde(default = "default_usb_interface")]
        interface: u8,
        #[serde(default = "default_usb_timeout_ms")]
        timeout_ms: u64,
    },
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Udp {
            address: default_udp_address(),
        }
    }
}

fn default_udp_address() -> String {
    DEFAULT_EMULATOR_ADDRESS.to_string()
}

fn default_vendor_id() -> u16 {
    0x1209
}

fn default_product_id() -> u16 {
    0x53c1
}

fn default_usb_interface() -> u8 {
    DEFAULT_USB_INTERFACE
}

fn default_usb_timeout_ms() -> u64 {
    DEFAULT_USB_TIMEOUT_MS
}

fn default_entropy_len() -> usize {
    DEFAULT_ENTROPY_LEN
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default = "default_entropy_len")]
    pub entropy_len: usize,
    #[serde(default)]
    pub prev_hash_order: PrevHashOrder,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            entropy_len: DEFAULT_ENTROPY_LEN,
            prev_hash_order: PrevHashOrder::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| DeviceError::invalid(format!("invalid session config: {err}")))?;
        if config.entropy_len == 0 {
            return Err(DeviceError::invalid("entropy_len must be positive"));
        }
        Ok(config)
    }
}

/// Opens the link `config` describes.
pub async fn open_link(config: &TransportConfig) -> Result<Box<dyn Link>> {
    match config {
        TransportConfig::Udp { address } => {
            debug!(%address, "opening UDP link");
            Ok(Box::new(UdpLink::connect(address).await?))
        }
        #[cfg(feature = "usb")]
        TransportConfig::Usb {
            vendor_id,
            product_id,
            interface,
            timeout_ms,
        } => {
            let link = crate::transport::UsbLink::open(
                *vendor_id,
                *product_id,
                *interface,
                std::time::Duration::from_millis(*timeout_ms),
            )?;
            Ok(Box::new(link))
        }
        #[cfg(not(feature = "usb"))]
        TransportConfig::Usb { .. } => Err(DeviceError::invalid(
            "USB transport requires the `usb` feature",
        )),
    }
}

/// Opens the configured link and wraps it in a session on the built-in schema.
pub async fn open_session(config: &SessionConfig) -> Result<DeviceSession<Box<dyn Link>>> {
    let link = open_link(&config.transport).await?;
    let mut session = DeviceSession::with_transport(Transport::new(link), MessageRegistry::trezor());
    session.set_entropy_len(config.entropy_len);
    Ok(session)
}
