use std::convert::TryFrom;

use hw_chain::bip32::unharden;
use prost::Message;

use super::{device_messages, HdNode};

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum InputScriptType {
    SpendAddress = 0,
    SpendMultisig = 1,
    External = 2,
    SpendWitness = 3,
    SpendP2shWitness = 4,
    SpendTaproot = 5,
}

impl InputScriptType {
    /// Script type implied by the purpose field of a derivation path.
    pub fn from_path(path: &[u32]) -> Option<Self> {
        let purpose = path.first().copied().map(unharden)?;
        let script_type = match purpose {
            44 => Self::SpendAddress,
            48 => match path.get(3).copied().map(unharden)? {
                0 => Self::SpendMultisig,
                1 => Self::SpendP2shWitness,
                2 => Self::SpendWitness,
                _ => return None,
            },
            49 => Self::SpendP2shWitness,
            84 => Self::SpendWitness,
            86 => Self::SpendTaproot,
            _ => return None,
        };
        Some(script_type)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum OutputScriptType {
    PayToAddress = 0,
    PayToScriptHash = 1,
    PayToMultisig = 2,
    PayToOpReturn = 3,
    PayToWitness = 4,
    PayToP2shWitness = 5,
    PayToTaproot = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum RequestType {
    TxInput = 0,
    TxOutput = 1,
    TxMeta = 2,
    TxFinished = 3,
    TxExtraData = 4,
    TxOrigInput = 5,
    TxOrigOutput = 6,
    TxPaymentReq = 7,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetPublicKey {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub address_n: Vec<u32>,
    #[prost(string, optional, tag = "2")]
    pub ecdsa_curve_name: Option<String>,
    #[prost(bool, optional, tag = "3")]
    pub show_display: Option<bool>,
    #[prost(string, optional, tag = "4")]
    pub coin_name: Option<String>,
    #[prost(enumeration = "InputScriptType", optional, tag = "5")]
    pub script_type: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PublicKey {
    #[prost(message, optional, tag = "1")]
    pub node: Option<HdNode>,
    #[prost(string, required, tag = "2")]
    pub xpub: String,
    #[prost(uint32, optional, tag = "3")]
    pub root_fingerprint: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetAddress {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub address_n: Vec<u32>,
    #[prost(string, optional, tag = "2")]
    pub coin_name: Option<String>,
    #[prost(bool, optional, tag = "3")]
    pub show_display: Option<bool>,
    #[prost(enumeration = "InputScriptType", optional, tag = "5")]
    pub script_type: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Address {
    #[prost(string, required, tag = "1")]
    pub address: String,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub mac: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SignMessage {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub address_n: Vec<u32>,
    #[prost(bytes = "vec", required, tag = "2")]
    pub message: Vec<u8>,
    #[prost(string, optional, tag = "3")]
    pub coin_name: Option<String>,
    #[prost(enumeration = "InputScriptType", optional, tag = "4")]
    pub script_type: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct MessageSignature {
    #[prost(string, required, tag = "1")]
    pub address: String,
    #[prost(bytes = "vec", required, tag = "2")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SignTx {
    #[prost(uint32, required, tag = "1")]
    pub outputs_count: u32,
    #[prost(uint32, required, tag = "2")]
    pub inputs_count: u32,
    #[prost(string, optional, tag = "3")]
    pub coin_name: Option<String>,
    #[prost(uint32, optional, tag = "4")]
    pub version: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub lock_time: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub expiry: Option<u32>,
    #[prost(bool, optional, tag = "7")]
    pub overwintered: Option<bool>,
    #[prost(uint32, optional, tag = "8")]
    pub version_group_id: Option<u32>,
    #[prost(uint32, optional, tag = "9")]
    pub timestamp: Option<u32>,
    #[prost(uint32, optional, tag = "10")]
    pub branch_id: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TxRequest {
    #[prost(enumeration = "RequestType", optional, tag = "1")]
    pub request_type: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub details: Option<TxRequestDetails>,
    #[prost(message, optional, tag = "3")]
    pub serialized: Option<TxRequestSerialized>,
}

impl TxRequest {
    /// The decoded request type; `None` when absent or not a known value.
    pub fn kind(&self) -> Option<RequestType> {
        self.request_type
            .and_then(|value| RequestType::try_from(value).ok())
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct TxRequestDetails {
    #[prost(uint32, optional, tag = "1")]
    pub request_index: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub tx_hash: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "3")]
    pub extra_data_len: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub extra_data_offset: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TxRequestSerialized {
    #[prost(uint32, optional, tag = "1")]
    pub signature_index: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub signature: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub serialized_tx: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TxAck {
    #[prost(message, optional, tag = "1")]
    pub tx: Option<TransactionType>,
}

/// The legacy `TxAck.tx` envelope; one populated field per answer.
#[derive(Clone, PartialEq, Message)]
pub struct TransactionType {
    #[prost(uint32, optional, tag = "1")]
    pub version: Option<u32>,
    #[prost(message, repeated, tag = "2")]
    pub inputs: Vec<TxInputType>,
    #[prost(message, repeated, tag = "3")]
    pub bin_outputs: Vec<TxOutputBinType>,
    #[prost(uint32, optional, tag = "4")]
    pub lock_time: Option<u32>,
    #[prost(message, repeated, tag = "5")]
    pub outputs: Vec<TxOutputType>,
    #[prost(uint32, optional, tag = "6")]
    pub inputs_cnt: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub outputs_cnt: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "8")]
    pub extra_data: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "9")]
    pub extra_data_len: Option<u32>,
    #[prost(uint32, optional, tag = "10")]
    pub expiry: Option<u32>,
    #[prost(bool, optional, tag = "11")]
    pub overwintered: Option<bool>,
    #[prost(uint32, optional, tag = "12")]
    pub version_group_id: Option<u32>,
    #[prost(uint32, optional, tag = "13")]
    pub timestamp: Option<u32>,
    #[prost(uint32, optional, tag = "14")]
    pub branch_id: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TxInputType {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub address_n: Vec<u32>,
    #[prost(bytes = "vec", required, tag = "2")]
    pub prev_hash: Vec<u8>,
    #[prost(uint32, required, tag = "3")]
    pub prev_index: u32,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub script_sig: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "5")]
    pub sequence: Option<u32>,
    #[prost(enumeration = "InputScriptType", optional, tag = "6")]
    pub script_type: Option<i32>,
    #[prost(uint64, optional, tag = "8")]
    pub amount: Option<u64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TxOutputBinType {
    #[prost(uint64, required, tag = "1")]
    pub amount: u64,
    #[prost(bytes = "vec", required, tag = "2")]
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TxOutputType {
    #[prost(string, optional, tag = "1")]
    pub address: Option<String>,
    #[prost(uint32, repeated, packed = "false", tag = "2")]
    pub address_n: Vec<u32>,
    #[prost(uint64, required, tag = "3")]
    pub amount: u64,
    #[prost(enumeration = "OutputScriptType", optional, tag = "4")]
    pub script_type: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub op_return_data: Option<Vec<u8>>,
}

device_messages!(
    GetPublicKey,
    PublicKey,
    GetAddress,
    Address,
    SignMessage,
    MessageSignature,
    SignTx,
    TxRequest,
    TxAck,
);
