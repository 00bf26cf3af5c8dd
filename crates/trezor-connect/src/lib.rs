//! Host side of the Trezor v1 wire protocol: links, framed transport, message
//! registry, the device session and the Bitcoin and Ethereum signing flows.

pub mod bitcoin;
pub mod commands;
pub mod config;
pub mod error;
pub mod ethereum;
pub mod hex;
mod latch;
pub mod link;
pub mod messages;
pub mod registry;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use bitcoin::{
    BitcoinSigner, BitcoinTx, PrevHashOrder, RefTransaction, RefTxInput, RefTxOutput, SignedTx,
    SigningContext, TxInput, TxOutput,
};
pub use config::{open_link, open_session, SessionConfig, TransportConfig};
pub use error::{DeviceError, ErrorKind, Result};
pub use ethereum::{AccessListEntry, EthSignature, EthSigningContext, EthereumSigner, EthereumTx};
pub use latch::SignerState;
pub use link::{Link, LinkError};
pub use registry::{MessageRegistry, TREZOR_SCHEMA};
pub use session::{
    DeviceEvent, DevicePrompt, DeviceSession, FailureRoute, PromptHandler, PromptReply,
};
pub use transport::{Transport, UdpLink};
#[cfg(feature = "usb")]
pub use transport::UsbLink;
