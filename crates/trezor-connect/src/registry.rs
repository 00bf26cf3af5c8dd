use std::collections::HashMap;

use hw_codec::RawMessage;

use crate::error::{DeviceError, Result};
use crate::messages::DeviceMessage;

/// Name and type code of every message this crate exchanges with Trezor firmware.
pub const TREZOR_SCHEMA: &[(&str, u16)] = &[
    ("Initialize", 0),
    ("Ping", 1),
    ("Success", 2),
    ("Failure", 3),
    ("GetPublicKey", 11),
    ("PublicKey", 12),
    ("SignTx", 15),
    ("Features", 17),
    ("PinMatrixRequest", 18),
    ("PinMatrixAck", 19),
    ("Cancel", 20),
    ("TxRequest", 21),
    ("TxAck", 22),
    ("ButtonRequest", 26),
    ("ButtonAck", 27),
    ("GetAddress", 29),
    ("Address", 30),
    ("EntropyRequest", 35),
    ("EntropyAck", 36),
    ("SignMessage", 38),
    ("MessageSignature", 40),
    ("PassphraseRequest", 41),
    ("PassphraseAck", 42),
    ("WordRequest", 46),
    ("WordAck", 47),
    ("GetFeatures", 55),
    ("EthereumGetAddress", 56),
    ("EthereumAddress", 57),
    ("EthereumSignTx", 58),
    ("EthereumTxRequest", 59),
    ("EthereumTxAck", 60),
    ("EthereumSignMessage", 64),
    ("EthereumMessageSignature", 66),
    ("PassphraseStateRequest", 77),
    ("PassphraseStateAck", 78),
    ("EthereumGetPublicKey", 450),
    ("EthereumPublicKey", 451),
    ("EthereumSignTxEIP1559", 452),
];

/// Two-way lookup between message names and wire type codes, plus typed
/// encode/decode through the prost structs in [`crate::messages`].
#[derive(Debug, Clone)]
pub struct MessageRegistry {
    codes: HashMap<&'static str, u16>,
    names: HashMap<u16, &'static str>,
}

impl MessageRegistry {
    pub fn trezor() -> Self {
        let mut registry = Self {
            codes: HashMap::with_capacity(TREZOR_SCHEMA.len()),
            names: HashMap::with_capacity(TREZOR_SCHEMA.len()),
        };
        for &(name, code) in TREZOR_SCHEMA {
            registry.codes.insert(name, code);
            registry.names.insert(code, name);
        }
        registry
    }

    /// Builds a registry from a caller-supplied schema table. Duplicate names
    /// or codes are rejected.
    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'static str, u16)>,
    {
        let mut codes = HashMap::new();
        let mut names = HashMap::new();
        for (name, code) in entries {
            if codes.insert(name, code).is_some() {
                return Err(DeviceError::invalid(format!(
                    "duplicate message name {name} in schema"
                )));
            }
            if let Some(existing) = names.insert(code, name) {
                return Err(DeviceError::invalid(format!(
                    "type code {code} assigned to both {existing} and {name}"
                )));
            }
        }
        Ok(Self { codes, names })
    }

    pub fn type_code_of(&self, name: &str) -> Result<u16> {
        self.codes
            .get(name)
            .copied()
            .ok_or_else(|| DeviceError::UnknownMessage(name.to_string()))
    }

    pub fn name_of(&self, code: u16) -> Result<&'static str> {
        self.names
            .get(&code)
            .copied()
            .ok_or_else(|| DeviceError::UnknownMessage(format!("type code {code}")))
    }

    pub fn encode<M: DeviceMessage>(&self, message: &M) -> Result<RawMessage> {
        let message_type = self.type_code_of(M::NAME)?;
        let mut payload = Vec::with_capacity(message.encoded_len());
        message.encode(&mut payload)?;
        Ok(RawMessage {
            message_type,
            payload,
        })
    }

    /// Decodes `raw` as `M`, failing if its type code names another message.
    pub fn decode<M: DeviceMessage>(&self, raw: &RawMessage) -> Result<M> {
        let name = self.name_of(raw.message_type)?;
        if name != M::NAME {
            return Err(DeviceError::UnexpectedResponse {
                expected: M::NAME,
                actual: name.to_string(),
            });
        }
        Ok(M::decode(raw.payload.as_slice())?)
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::trezor()
    }
}
