use prost::Message;

use super::{device_messages, DeviceMessage, HdNode};

/// Largest call-data slice carried by a single sign or ack message.
pub const ETH_DATA_CHUNK_SIZE: usize = 1024;

#[derive(Clone, PartialEq, Message)]
pub struct EthereumGetAddress {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub address_n: Vec<u32>,
    #[prost(bool, optional, tag = "2")]
    pub show_display: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EthereumAddress {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub old_address: Option<Vec<u8>>,
    #[prost(string, optional, tag = "2")]
    pub address: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EthereumGetPublicKey {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub address_n: Vec<u32>,
    #[prost(bool, optional, tag = "2")]
    pub show_display: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EthereumPublicKey {
    #[prost(message, optional, tag = "1")]
    pub node: Option<HdNode>,
    #[prost(string, optional, tag = "2")]
    pub xpub: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EthereumSignMessage {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub address_n: Vec<u32>,
    #[prost(bytes = "vec", required, tag = "2")]
    pub message: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EthereumMessageSignature {
    #[prost(bytes = "vec", required, tag = "2")]
    pub signature: Vec<u8>,
    #[prost(string, required, tag = "3")]
    pub address: String,
}

/// Legacy (pre-London) transaction. Numeric fields are big-endian with
/// leading zero bytes trimmed.
#[derive(Clone, PartialEq, Message)]
pub struct EthereumSignTx {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub address_n: Vec<u32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub nonce: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub gas_price: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub gas_limit: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub value: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub data_initial_chunk: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "8")]
    pub data_length: Option<u32>,
    #[prost(uint64, optional, tag = "9")]
    pub chain_id: Option<u64>,
    #[prost(uint32, optional, tag = "10")]
    pub tx_type: Option<u32>,
    #[prost(string, optional, tag = "11")]
    pub to: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EthereumAccessList {
    #[prost(string, required, tag = "1")]
    pub address: String,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub storage_keys: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EthereumSignTxEip1559 {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub address_n: Vec<u32>,
    #[prost(bytes = "vec", required, tag = "2")]
    pub nonce: Vec<u8>,
    #[prost(bytes = "vec", required, tag = "3")]
    pub max_gas_fee: Vec<u8>,
    #[prost(bytes = "vec", required, tag = "4")]
    pub max_priority_fee: Vec<u8>,
    #[prost(bytes = "vec", required, tag = "5")]
    pub gas_limit: Vec<u8>,
    #[prost(string, optional, tag = "6")]
    pub to: Option<String>,
    #[prost(bytes = "vec", required, tag = "7")]
    pub value: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "8")]
    pub data_initial_chunk: Option<Vec<u8>>,
    #[prost(uint32, required, tag = "9")]
    pub data_length: u32,
    #[prost(uint64, required, tag = "10")]
    pub chain_id: u64,
    #[prost(message, repeated, tag = "11")]
    pub access_list: Vec<EthereumAccessList>,
}

impl DeviceMessage for EthereumSignTxEip1559 {
    const NAME: &'static str = "EthereumSignTxEIP1559";
}

#[derive(Clone, PartialEq, Message)]
pub struct EthereumTxRequest {
    #[prost(uint32, optional, tag = "1")]
    pub data_length: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub signature_v: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub signature_r: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub signature_s: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EthereumTxAck {
    #[prost(bytes = "vec", required, tag = "1")]
    pub data_chunk: Vec<u8>,
}

device_messages!(
    EthereumGetAddress,
    EthereumAddress,
    EthereumGetPublicKey,
    EthereumPublicKey,
    EthereumSignMessage,
    EthereumMessageSignature,
    EthereumSignTx,
    EthereumTxRequest,
    EthereumTxAck,
);
