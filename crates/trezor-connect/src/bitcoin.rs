//! Bitcoin-family transaction signing: the `SignTx` / `TxRequest` / `TxAck`
//! exchange in which the device pulls every piece of the transaction, and of
//! the transactions it spends from, one request at a time.

use std::collections::HashMap;
use std::time::Instant;

use hw_chain::{coin_by_name, is_segwit_path, CoinInfo};
use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::config::SessionConfig;
use crate::error::{DeviceError, Result};
use crate::hex::{decode, reversed};
use crate::latch::{SignerLatch, SignerState};
use crate::link::Link;
use crate::messages::{
    InputScriptType, OutputScriptType, RequestType, SignTx, TransactionType, TxAck, TxInputType,
    TxOutputBinType, TxOutputType, TxRequest,
};
use crate::session::{DeviceSession, FailureRoute};

const DEFAULT_SEQUENCE: u32 = 0xffff_ffff;

/// Byte order of `prev_hash` on the wire relative to the hex the caller gave.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrevHashOrder {
    /// Decoded bytes are sent unchanged (display order, as trezorlib sends).
    #[default]
    AsGiven,
    /// Decoded bytes are reversed before sending.
    Reversed,
}

impl PrevHashOrder {
    fn to_wire(self, bytes: Vec<u8>) -> Vec<u8> {
        match self {
            Self::AsGiven => bytes,
            Self::Reversed => reversed(&bytes),
        }
    }

    /// Ref-transaction key for a hash the device echoes back.
    fn lookup_key(self, wire: &[u8]) -> String {
        match self {
            Self::AsGiven => ::hex::encode(wire),
            Self::Reversed => ::hex::encode(reversed(wire)),
        }
    }
}

/// Transaction to sign. Amounts are decimal strings in the coin's base unit.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BitcoinTx {
    pub coin_name: String,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    #[serde(default, deserialize_with = "optional_u32")]
    pub version: Option<u32>,
    #[serde(default, deserialize_with = "optional_u32")]
    pub lock_time: Option<u32>,
    #[serde(default, deserialize_with = "optional_u32")]
    pub expiry: Option<u32>,
    #[serde(default)]
    pub overwintered: Option<bool>,
    #[serde(default, deserialize_with = "optional_u32")]
    pub version_group_id: Option<u32>,
    #[serde(default, deserialize_with = "optional_u32")]
    pub timestamp: Option<u32>,
    #[serde(default, deserialize_with = "optional_u32")]
    pub branch_id: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TxInput {
    #[serde(default)]
    pub address_n: Vec<u32>,
    pub prev_hash: Option<String>,
    pub prev_index: Option<u32>,
    pub amount: Option<String>,
    pub sequence: Option<u32>,
    pub script_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TxOutput {
    pub address: Option<String>,
    pub address_n: Option<Vec<u32>>,
    pub amount: String,
    pub script_type: Option<String>,
    pub op_return_data: Option<String>,
}

/// A confirmed transaction one of the inputs spends from.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefTransaction {
    pub hash: String,
    pub version: u32,
    pub lock_time: u32,
    pub inputs: Vec<RefTxInput>,
    pub bin_outputs: Vec<RefTxOutput>,
    pub extra_data: Option<String>,
    pub timestamp: Option<u32>,
    pub version_group_id: Option<u32>,
    pub expiry: Option<u32>,
    pub branch_id: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefTxInput {
    pub prev_hash: String,
    pub prev_index: u32,
    pub script_sig: String,
    #[serde(default = "default_sequence")]
    pub sequence: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefTxOutput {
    pub amount: String,
    pub script_pubkey: String,
}

fn default_sequence() -> u32 {
    DEFAULT_SEQUENCE
}

fn optional_u32<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Numeric {
        Number(u32),
        Text(String),
    }

    match Option::<Numeric>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Numeric::Number(value)) => Ok(Some(value)),
        Some(Numeric::Text(text)) => text
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("'{text}' is not numeric"))),
    }
}

impl BitcoinTx {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|err| DeviceError::invalid(format!("invalid bitcoin tx JSON: {err}")))
    }
}

impl RefTransaction {
    pub fn list_from_json(json: &str) -> Result<Vec<Self>> {
        serde_json::from_str(json)
            .map_err(|err| DeviceError::invalid(format!("invalid ref_txs JSON: {err}")))
    }
}

/// Outcome of a finished signing exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub serialized_tx: Vec<u8>,
    /// Indexed by input; `None` for inputs the device did not sign.
    pub signatures: Vec<Option<Vec<u8>>>,
}

impl SignedTx {
    pub fn serialized_hex(&self) -> String {
        ::hex::encode(&self.serialized_tx)
    }
}

/// Describes the operation currently holding a [`BitcoinSigner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningContext {
    pub coin_name: String,
    pub inputs: usize,
    pub outputs: usize,
    pub started_at: Instant,
}

/// Device-ready form of a validated transaction and its ref transactions.
#[derive(Debug)]
pub(crate) struct PreparedTx {
    pub(crate) coin: &'static CoinInfo,
    pub(crate) sign_tx: SignTx,
    pub(crate) inputs: Vec<TxInputType>,
    pub(crate) outputs: Vec<TxOutputType>,
    pub(crate) refs: HashMap<String, PreparedRefTx>,
    pub(crate) order: PrevHashOrder,
}

#[derive(Debug)]
pub(crate) struct PreparedRefTx {
    pub(crate) version: u32,
    pub(crate) lock_time: u32,
    pub(crate) inputs: Vec<TxInputType>,
    pub(crate) bin_outputs: Vec<TxOutputBinType>,
    pub(crate) extra_data: Option<Vec<u8>>,
    pub(crate) timestamp: Option<u32>,
    pub(crate) version_group_id: Option<u32>,
    pub(crate) expiry: Option<u32>,
    pub(crate) branch_id: Option<u32>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum TxRequestStep {
    Ack(TransactionType),
    Finished,
}

/// Runs Bitcoin-family signing operations, one at a time.
#[derive(Debug)]
pub struct BitcoinSigner {
    latch: SignerLatch<SigningContext>,
    prev_hash_order: PrevHashOrder,
}

impl Default for BitcoinSigner {
    fn default() -> Self {
        Self::new(PrevHashOrder::default())
    }
}

impl BitcoinSigner {
    pub fn new(prev_hash_order: PrevHashOrder) -> Self {
        Self {
            latch: SignerLatch::new(),
            prev_hash_order,
        }
    }

    /// Signer using the `prev_hash` order from `config`.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.prev_hash_order)
    }

    pub fn state(&self) -> SignerState<SigningContext> {
        self.latch.snapshot()
    }

    /// Signs `tx`, answering every device request until `TXFINISHED`.
    ///
    /// Input is validated before anything reaches the device. A concurrent
    /// call on the same signer fails with [`DeviceError::Busy`].
    pub async fn sign_tx<L: Link>(
        &self,
        session: &mut DeviceSession<L>,
        tx: &BitcoinTx,
        ref_txs: &[RefTransaction],
    ) -> Result<SignedTx> {
        let _guard = self.latch.begin(SigningContext {
            coin_name: tx.coin_name.clone(),
            inputs: tx.inputs.len(),
            outputs: tx.outputs.len(),
            started_at: Instant::now(),
        })?;

        let prepared = prepare(tx, ref_txs, self.prev_hash_order)?;
        debug!(
            coin = prepared.coin.name,
            inputs = prepared.inputs.len(),
            outputs = prepared.outputs.len(),
            ref_txs = prepared.refs.len(),
            "BTC sign start"
        );

        let mut serialized_tx = Vec::new();
        let mut signatures: Vec<Option<Vec<u8>>> = vec![None; prepared.inputs.len()];
        let mut rounds = 0usize;
        let mut request: TxRequest = session
            .call_with(&prepared.sign_tx, FailureRoute::Caller)
            .await?;

        loop {
            rounds += 1;
            collect_serialized(&request, &mut serialized_tx, &mut signatures)?;
            debug!(
                round = rounds,
                request_type = ?request.kind(),
                request_index = ?request.details.as_ref().and_then(|d| d.request_index),
                ref_tx = request.details.as_ref().is_some_and(|d| d.tx_hash.is_some()),
                "BTC sign RX TxRequest"
            );

            match answer_tx_request(&prepared, &request)? {
                TxRequestStep::Finished => break,
                TxRequestStep::Ack(tx) => {
                    request = session
                        .call_with(&TxAck { tx: Some(tx) }, FailureRoute::Caller)
                        .await?;
                }
            }
        }

        debug!(
            rounds,
            serialized_len = serialized_tx.len(),
            "BTC sign finished"
        );
        Ok(SignedTx {
            serialized_tx,
            signatures,
        })
    }
}

fn collect_serialized(
    request: &TxRequest,
    serialized_tx: &mut Vec<u8>,
    signatures: &mut [Option<Vec<u8>>],
) -> Result<()> {
    let Some(serialized) = &request.serialized else {
        return Ok(());
    };
    if let Some(chunk) = &serialized.serialized_tx {
        serialized_tx.extend_from_slice(chunk);
    }
    if let Some(index) = serialized.signature_index {
        let inputs = signatures.len();
        let slot = signatures.get_mut(index as usize).ok_or_else(|| {
            DeviceError::Protocol(format!(
                "signature_index {index} out of range for {inputs} inputs"
            ))
        })?;
        *slot = serialized.signature.clone();
    }
    Ok(())
}

/// Computes the `TxAck` payload for one device request.
pub(crate) fn answer_tx_request(tx: &PreparedTx, request: &TxRequest) -> Result<TxRequestStep> {
    let kind = request.kind().ok_or_else(|| {
        DeviceError::Protocol(format!(
            "TxRequest carries unknown request_type {:?}",
            request.request_type
        ))
    })?;
    if kind == RequestType::TxFinished {
        return Ok(TxRequestStep::Finished);
    }

    let details = request
        .details
        .as_ref()
        .ok_or_else(|| DeviceError::Protocol(format!("{kind:?} request without details")))?;

    let Some(tx_hash) = &details.tx_hash else {
        let index = request_index(kind, details.request_index)?;
        return match kind {
            RequestType::TxInput => {
                let input = tx.inputs.get(index).ok_or_else(|| out_of_range("input", index))?;
                Ok(TxRequestStep::Ack(TransactionType {
                    inputs: vec![input.clone()],
                    ..Default::default()
                }))
            }
            RequestType::TxOutput => {
                let output = tx
                    .outputs
                    .get(index)
                    .ok_or_else(|| out_of_range("output", index))?;
                Ok(TxRequestStep::Ack(TransactionType {
                    outputs: vec![output.clone()],
                    ..Default::default()
                }))
            }
            other => Err(DeviceError::Protocol(format!(
                "{other:?} requested for the transaction being signed"
            ))),
        };
    };

    let key = tx.order.lookup_key(tx_hash);
    let ref_tx = tx
        .refs
        .get(&key)
        .ok_or_else(|| DeviceError::UnknownTx(key.clone()))?;

    match kind {
        RequestType::TxInput => {
            let index = request_index(kind, details.request_index)?;
            let input = ref_tx
                .inputs
                .get(index)
                .ok_or_else(|| out_of_range("ref tx input", index))?;
            Ok(TxRequestStep::Ack(TransactionType {
                inputs: vec![input.clone()],
                ..Default::default()
            }))
        }
        RequestType::TxOutput => {
            let index = request_index(kind, details.request_index)?;
            let output = ref_tx
                .bin_outputs
                .get(index)
                .ok_or_else(|| out_of_range("ref tx output", index))?;
            Ok(TxRequestStep::Ack(TransactionType {
                bin_outputs: vec![output.clone()],
                ..Default::default()
            }))
        }
        RequestType::TxExtraData => {
            let (Some(len), Some(offset)) = (details.extra_data_len, details.extra_data_offset)
            else {
                return Err(DeviceError::Protocol(
                    "TxExtraData request without extra_data_len/extra_data_offset".to_string(),
                ));
            };
            let extra = ref_tx.extra_data.as_deref().ok_or_else(|| {
                DeviceError::Protocol(format!("ref tx {key} has no extra data"))
            })?;
            let start = offset as usize;
            let end = start + len as usize;
            let chunk = extra.get(start..end).ok_or_else(|| {
                DeviceError::Protocol(format!(
                    "extra data range {start}..{end} exceeds {} bytes of ref tx {key}",
                    extra.len()
                ))
            })?;
            Ok(TxRequestStep::Ack(TransactionType {
                extra_data: Some(chunk.to_vec()),
                ..Default::default()
            }))
        }
        RequestType::TxMeta => Ok(TxRequestStep::Ack(TransactionType {
            version: Some(ref_tx.version),
            lock_time: Some(ref_tx.lock_time),
            inputs_cnt: Some(ref_tx.inputs.len() as u32),
            outputs_cnt: Some(ref_tx.bin_outputs.len() as u32),
            extra_data_len: ref_tx.extra_data.as_ref().map(|data| data.len() as u32),
            timestamp: ref_tx.timestamp,
            version_group_id: ref_tx.version_group_id,
            expiry: ref_tx.expiry,
            branch_id: ref_tx.branch_id,
            ..Default::default()
        })),
        other => Err(DeviceError::Protocol(format!(
            "unsupported request {other:?} for ref tx {key}"
        ))),
    }
}

fn request_index(kind: RequestType, index: Option<u32>) -> Result<usize> {
    index
        .map(|index| index as usize)
        .ok_or_else(|| DeviceError::Protocol(format!("{kind:?} request without request_index")))
}

fn out_of_range(what: &str, index: usize) -> DeviceError {
    DeviceError::Protocol(format!("device requested {what} {index}, which does not exist"))
}

/// Validates the caller's transaction and converts it to wire structs.
pub(crate) fn prepare(
    tx: &BitcoinTx,
    ref_txs: &[RefTransaction],
    order: PrevHashOrder,
) -> Result<PreparedTx> {
    if tx.coin_name.trim().is_empty() {
        return Err(DeviceError::invalid("coin_name is required"));
    }
    let coin = coin_by_name(&tx.coin_name)
        .ok_or_else(|| DeviceError::invalid(format!("unknown coin '{}'", tx.coin_name)))?;
    if tx.inputs.is_empty() {
        return Err(DeviceError::invalid("transaction must contain at least one input"));
    }
    if tx.outputs.is_empty() {
        return Err(DeviceError::invalid("transaction must contain at least one output"));
    }

    let inputs = tx
        .inputs
        .iter()
        .enumerate()
        .map(|(index, input)| prepare_input(coin, index, input, order))
        .collect::<Result<Vec<_>>>()?;

    let mut total: u64 = 0;
    let mut outputs = Vec::with_capacity(tx.outputs.len());
    for (index, output) in tx.outputs.iter().enumerate() {
        let prepared = prepare_output(index, output)?;
        if prepared.script_type != Some(OutputScriptType::PayToOpReturn as i32) {
            total = total
                .checked_add(prepared.amount)
                .ok_or_else(|| DeviceError::invalid("total output amount overflows"))?;
        }
        outputs.push(prepared);
    }
    if total <= coin.dust_limit {
        return Err(DeviceError::invalid(format!(
            "total output amount {total} does not exceed the {} dust limit {}",
            coin.name, coin.dust_limit
        )));
    }

    let mut refs = HashMap::with_capacity(ref_txs.len());
    for ref_tx in ref_txs {
        let key = normalize_hash(&ref_tx.hash);
        if refs.contains_key(&key) {
            return Err(DeviceError::invalid(format!("duplicate ref_txs hash {key}")));
        }
        refs.insert(key, prepare_ref_tx(ref_tx, order)?);
    }

    let sign_tx = SignTx {
        outputs_count: outputs.len() as u32,
        inputs_count: inputs.len() as u32,
        coin_name: Some(coin.name.to_string()),
        version: tx.version,
        lock_time: tx.lock_time,
        expiry: tx.expiry,
        overwintered: tx.overwintered,
        version_group_id: tx.version_group_id,
        timestamp: tx.timestamp,
        branch_id: tx.branch_id,
    };

    Ok(PreparedTx {
        coin,
        sign_tx,
        inputs,
        outputs,
        refs,
        order,
    })
}

fn prepare_input(
    coin: &CoinInfo,
    index: usize,
    input: &TxInput,
    order: PrevHashOrder,
) -> Result<TxInputType> {
    let prev_hash = input
        .prev_hash
        .as_deref()
        .ok_or_else(|| DeviceError::invalid(format!("input {index} is missing prev_hash")))?;
    let prev_index = input
        .prev_index
        .ok_or_else(|| DeviceError::invalid(format!("input {index} is missing prev_index")))?;
    let prev_hash = parse_hash32(&format!("input {index} prev_hash"), prev_hash)?;

    let script_type = match input.script_type.as_deref() {
        Some(value) => Some(parse_input_script_type(value)?),
        None => InputScriptType::from_path(&input.address_n),
    };
    let segwit = is_segwit_path(&input.address_n)
        || matches!(
            script_type,
            Some(
                InputScriptType::SpendWitness
                    | InputScriptType::SpendP2shWitness
                    | InputScriptType::SpendTaproot
            )
        );
    if segwit && !coin.segwit {
        return Err(DeviceError::invalid(format!(
            "input {index} spends a segwit output, which {} does not support",
            coin.name
        )));
    }
    let amount = input.amount.as_deref().map(parse_amount).transpose()?;
    if segwit && amount.is_none() {
        return Err(DeviceError::invalid(format!(
            "input {index} spends a segwit output and requires amount"
        )));
    }

    Ok(TxInputType {
        address_n: input.address_n.clone(),
        prev_hash: order.to_wire(prev_hash),
        prev_index,
        script_sig: None,
        sequence: Some(input.sequence.unwrap_or(DEFAULT_SEQUENCE)),
        script_type: script_type.map(|t| t as i32),
        amount,
    })
}

fn prepare_output(index: usize, output: &TxOutput) -> Result<TxOutputType> {
    let op_return_data = output.op_return_data.as_deref().map(decode).transpose()?;
    let script_type = match output.script_type.as_deref() {
        Some(value) => parse_output_script_type(value)?,
        None if op_return_data.is_some() => OutputScriptType::PayToOpReturn,
        None => OutputScriptType::PayToAddress,
    };
    let is_op_return = script_type == OutputScriptType::PayToOpReturn;

    match (&output.address, &output.address_n) {
        (Some(_), Some(_)) => {
            return Err(DeviceError::invalid(format!(
                "output {index} cannot specify both address and address_n"
            )))
        }
        (None, None) if !is_op_return => {
            return Err(DeviceError::invalid(format!(
                "output {index} requires either address or address_n"
            )))
        }
        _ => {}
    }

    Ok(TxOutputType {
        address: output.address.clone(),
        address_n: output.address_n.clone().unwrap_or_default(),
        amount: parse_amount(&output.amount)?,
        script_type: Some(script_type as i32),
        op_return_data,
    })
}

fn prepare_ref_tx(tx: &RefTransaction, order: PrevHashOrder) -> Result<PreparedRefTx> {
    let inputs = tx
        .inputs
        .iter()
        .map(|input| {
            Ok(TxInputType {
                prev_hash: order.to_wire(parse_hash32("ref_txs.inputs.prev_hash", &input.prev_hash)?),
                prev_index: input.prev_index,
                script_sig: Some(decode(&input.script_sig)?),
                sequence: Some(input.sequence),
                ..Default::default()
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let bin_outputs = tx
        .bin_outputs
        .iter()
        .map(|output| {
            Ok(TxOutputBinType {
                amount: parse_amount(&output.amount)?,
                script_pubkey: decode(&output.script_pubkey)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PreparedRefTx {
        version: tx.version,
        lock_time: tx.lock_time,
        inputs,
        bin_outputs,
        extra_data: tx.extra_data.as_deref().map(decode).transpose()?,
        timestamp: tx.timestamp,
        version_group_id: tx.version_group_id,
        expiry: tx.expiry,
        branch_id: tx.branch_id,
    })
}

fn normalize_hash(value: &str) -> String {
    value
        .trim()
        .strip_prefix("0x")
        .unwrap_or(value.trim())
        .to_ascii_lowercase()
}

fn parse_hash32(field: &str, value: &str) -> Result<Vec<u8>> {
    let decoded = decode(value)?;
    if decoded.len() != 32 {
        return Err(DeviceError::invalid(format!(
            "{field} must be 32 bytes, got {} bytes",
            decoded.len()
        )));
    }
    Ok(decoded)
}

fn parse_amount(value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|err| DeviceError::invalid(format!("invalid amount '{value}': {err}")))
}

fn parse_input_script_type(value: &str) -> Result<InputScriptType> {
    match value.to_ascii_lowercase().as_str() {
        "spendaddress" | "p2pkh" => Ok(InputScriptType::SpendAddress),
        "spendmultisig" => Ok(InputScriptType::SpendMultisig),
        "external" => Ok(InputScriptType::External),
        "spendwitness" | "p2wpkh" => Ok(InputScriptType::SpendWitness),
        "spendp2shwitness" | "p2shwpkh" => Ok(InputScriptType::SpendP2shWitness),
        "spendtaproot" | "p2tr" => Ok(InputScriptType::SpendTaproot),
        other => Err(DeviceError::invalid(format!(
            "unsupported input script type '{other}'"
        ))),
    }
}

fn parse_output_script_type(value: &str) -> Result<OutputScriptType> {
    match value.to_ascii_lowercase().as_str() {
        "paytoaddress" | "address" => Ok(OutputScriptType::PayToAddress),
        "paytoscripthash" => Ok(OutputScriptType::PayToScriptHash),
        "paytomultisig" => Ok(OutputScriptType::PayToMultisig),
        "paytoopreturn" | "opreturn" => Ok(OutputScriptType::PayToOpReturn),
        "paytowitness" => Ok(OutputScriptType::PayToWitness),
        "paytop2shwitness" => Ok(OutputScriptType::PayToP2shWitness),
        "paytotaproot" => Ok(OutputScriptType::PayToTaproot),
        other => Err(DeviceError::invalid(format!(
            "unsupported output script type '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests;
