//! Ethereum transaction signing: the call data goes out in chunks, as many as
//! the device asks for, and the last `EthereumTxRequest` carries the
//! signature.

use std::time::Instant;

use serde::Deserialize;
use tracing::debug;

use crate::error::{DeviceError, Result};
use crate::hex::{decode, decode_quantity};
use crate::latch::{SignerLatch, SignerState};
use crate::link::Link;
use crate::messages::{
    EthereumAccessList, EthereumSignTx, EthereumSignTxEip1559, EthereumTxAck, EthereumTxRequest,
    ETH_DATA_CHUNK_SIZE,
};
use crate::session::{DeviceSession, FailureRoute};

/// Transaction to sign. Quantities are hex strings (`0x` optional).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EthereumTx {
    pub address_n: Vec<u32>,
    #[serde(default = "default_hex_zero")]
    pub nonce: String,
    #[serde(default)]
    pub gas_price: Option<String>,
    #[serde(default = "default_hex_zero")]
    pub gas_limit: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default = "default_hex_zero")]
    pub value: String,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub tx_type: Option<u32>,
    #[serde(default)]
    pub max_fee_per_gas: Option<String>,
    #[serde(default)]
    pub max_priority_fee: Option<String>,
    #[serde(default)]
    pub access_list: Vec<AccessListEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessListEntry {
    pub address: String,
    #[serde(default)]
    pub storage_keys: Vec<String>,
}

fn default_hex_zero() -> String {
    "0x0".to_string()
}

impl EthereumTx {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|err| DeviceError::invalid(format!("invalid ethereum tx JSON: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthSignature {
    /// Absent when the device does not report a recovery value.
    pub v: Option<u64>,
    pub r: Vec<u8>,
    pub s: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthSigningContext {
    pub chain_id: Option<u64>,
    pub data_len: usize,
    pub started_at: Instant,
}

/// Runs Ethereum signing operations, one at a time.
#[derive(Debug)]
pub struct EthereumSigner {
    latch: SignerLatch<EthSigningContext>,
}

impl Default for EthereumSigner {
    fn default() -> Self {
        Self::new()
    }
}

enum SignRequest {
    Legacy(EthereumSignTx),
    Eip1559(EthereumSignTxEip1559),
}

impl EthereumSigner {
    pub fn new() -> Self {
        Self {
            latch: SignerLatch::new(),
        }
    }

    pub fn state(&self) -> SignerState<EthSigningContext> {
        self.latch.snapshot()
    }

    pub async fn sign_tx<L: Link>(
        &self,
        session: &mut DeviceSession<L>,
        tx: &EthereumTx,
    ) -> Result<EthSignature> {
        let data = tx.data.as_deref().map(decode).transpose()?.unwrap_or_default();
        let _guard = self.latch.begin(EthSigningContext {
            chain_id: tx.chain_id,
            data_len: data.len(),
            started_at: Instant::now(),
        })?;

        let data_length = u32::try_from(data.len())
            .map_err(|_| DeviceError::invalid("call data is too long"))?;
        let initial = data.len().min(ETH_DATA_CHUNK_SIZE);
        let (first_chunk, mut remaining) = data.split_at(initial);
        let first_chunk = (!first_chunk.is_empty()).then(|| first_chunk.to_vec());

        let request = build_request(tx, first_chunk, data_length)?;
        let eip1559 = matches!(request, SignRequest::Eip1559(_));
        debug!(
            eip1559,
            chain_id = ?tx.chain_id,
            data_len = data.len(),
            "ETH sign start"
        );

        let mut response: EthereumTxRequest = match &request {
            SignRequest::Legacy(message) => session.call_with(message, FailureRoute::Caller).await?,
            SignRequest::Eip1559(message) => {
                session.call_with(message, FailureRoute::Caller).await?
            }
        };

        loop {
            let requested = response.data_length.unwrap_or(0) as usize;
            if requested == 0 {
                break;
            }
            if requested > remaining.len() {
                return Err(DeviceError::Protocol(format!(
                    "device requested {requested} bytes of call data, {} left",
                    remaining.len()
                )));
            }
            let (chunk, rest) = remaining.split_at(requested);
            remaining = rest;
            debug!(chunk_len = chunk.len(), left = remaining.len(), "ETH sign TX chunk");
            response = session
                .call_with(
                    &EthereumTxAck {
                        data_chunk: chunk.to_vec(),
                    },
                    FailureRoute::Caller,
                )
                .await?;
        }

        let signature = signature_from(response, if eip1559 { None } else { tx.chain_id })?;
        debug!(v = ?signature.v, "ETH sign finished");
        Ok(signature)
    }
}

fn build_request(
    tx: &EthereumTx,
    data_initial_chunk: Option<Vec<u8>>,
    data_length: u32,
) -> Result<SignRequest> {
    let nonce = decode_quantity(&tx.nonce)?;
    let gas_limit = decode_quantity(&tx.gas_limit)?;
    let value = decode_quantity(&tx.value)?;

    if let (Some(max_fee), Some(priority_fee)) = (&tx.max_fee_per_gas, &tx.max_priority_fee) {
        let chain_id = tx
            .chain_id
            .ok_or_else(|| DeviceError::invalid("EIP-1559 transaction requires chain_id"))?;
        let access_list = tx
            .access_list
            .iter()
            .map(|entry| {
                Ok(EthereumAccessList {
                    address: entry.address.clone(),
                    storage_keys: entry
                        .storage_keys
                        .iter()
                        .map(|key| decode(key))
                        .collect::<Result<Vec<_>>>()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(SignRequest::Eip1559(EthereumSignTxEip1559 {
            address_n: tx.address_n.clone(),
            nonce,
            max_gas_fee: decode_quantity(max_fee)?,
            max_priority_fee: decode_quantity(priority_fee)?,
            gas_limit,
            to: tx.to.clone(),
            value,
            data_initial_chunk,
            data_length,
            chain_id,
            access_list,
        }));
    }

    if tx.max_fee_per_gas.is_some() || tx.max_priority_fee.is_some() {
        return Err(DeviceError::invalid(
            "max_fee_per_gas and max_priority_fee must be given together",
        ));
    }
    let gas_price = tx
        .gas_price
        .as_deref()
        .ok_or_else(|| DeviceError::invalid("legacy transaction requires gas_price"))?;

    Ok(SignRequest::Legacy(EthereumSignTx {
        address_n: tx.address_n.clone(),
        nonce: Some(nonce),
        gas_price: Some(decode_quantity(gas_price)?),
        gas_limit: Some(gas_limit),
        value: Some(value),
        data_initial_chunk,
        data_length: (data_length > 0).then_some(data_length),
        chain_id: tx.chain_id,
        tx_type: tx.tx_type,
        to: tx.to.clone(),
    }))
}

/// Extracts `{v, r, s}`, applying EIP-155 when `chain_id` is given and the
/// device reported a bare recovery id.
fn signature_from(response: EthereumTxRequest, chain_id: Option<u64>) -> Result<EthSignature> {
    let (Some(r), Some(s)) = (response.signature_r, response.signature_s) else {
        return Err(DeviceError::Protocol(
            "EthereumTxRequest without data_length or signature".to_string(),
        ));
    };
    let v = response
        .signature_v
        .map(|v| {
            let v = u64::from(v);
            match chain_id {
                Some(chain_id) if v <= 1 => chain_id
                    .checked_mul(2)
                    .and_then(|doubled| doubled.checked_add(v + 35))
                    .ok_or_else(|| {
                        DeviceError::invalid(format!("chain_id {chain_id} overflows EIP-155 v"))
                    }),
                _ => Ok(v),
            }
        })
        .transpose()?;
    Ok(EthSignature { v, r, s })
}
