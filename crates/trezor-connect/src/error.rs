use hw_codec::CodecError;
use thiserror::Error;

use crate::link::LinkError;

/// High-level category for a [`DeviceError`].
///
/// Lets callers branch on the failure class (retry, reconnect, fix input)
/// without matching every variant.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    /// The channel to the device is missing, closed or failing.
    Transport,
    /// The device spoke something this host did not expect.
    Protocol,
    /// The request was rejected before reaching the device.
    Validation,
    /// The device (or the user on it) refused the operation.
    Device,
    /// Another operation already holds the command object.
    Busy,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no transport attached to the session")]
    NoTransport,
    #[error("device not selected: transport is closed")]
    NotSelected,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: String,
    },
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("busy")]
    Busy,
    #[error("unknown message: {0}")]
    UnknownMessage(String),
    #[error("unknown tx requested: {0}")]
    UnknownTx(String),
    #[error("device failure: {message}")]
    DeviceFailure { code: Option<i32>, message: String },
    #[error("device disconnected")]
    DeviceDisconnected,
    #[error("transport error: {0}")]
    Transport(#[from] LinkError),
    #[error("message encode error: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("message decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The device asked for input and no [`crate::PromptHandler`] is installed.
    #[error("no prompt handler installed for {0}")]
    PromptUnhandled(&'static str),
    /// The installed handler declined to answer a prompt.
    #[error("prompt rejected: {0}")]
    PromptRejected(String),
}

pub type Result<T> = std::result::Result<T, DeviceError>;

impl From<CodecError> for DeviceError {
    fn from(error: CodecError) -> Self {
        Self::Protocol(error.to_string())
    }
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoTransport | Self::NotSelected | Self::DeviceDisconnected | Self::Transport(_) => {
                ErrorKind::Transport
            }
            Self::Protocol(_)
            | Self::UnexpectedResponse { .. }
            | Self::UnknownMessage(_)
            | Self::UnknownTx(_)
            | Self::Decode(_) => ErrorKind::Protocol,
            Self::InvalidParam(_) | Self::Encode(_) | Self::PromptUnhandled(_) => {
                ErrorKind::Validation
            }
            Self::DeviceFailure { .. } | Self::PromptRejected(_) => ErrorKind::Device,
            Self::Busy => ErrorKind::Busy,
        }
    }

    /// Short uppercase code, stable across releases, for logs and API payloads.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Transport => "TRANSPORT",
            ErrorKind::Protocol => "PROTOCOL",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Device => "DEVICE",
            ErrorKind::Busy => "BUSY",
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParam(message.into())
    }
}
