use prost::Message;

use super::device_messages;

#[derive(Clone, PartialEq, Message)]
pub struct Initialize {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub session_id: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetFeatures {}

#[derive(Clone, PartialEq, Message)]
pub struct Features {
    #[prost(string, optional, tag = "1")]
    pub vendor: Option<String>,
    #[prost(uint32, optional, tag = "2")]
    pub major_version: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub minor_version: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub patch_version: Option<u32>,
    #[prost(bool, optional, tag = "5")]
    pub bootloader_mode: Option<bool>,
    #[prost(string, optional, tag = "6")]
    pub device_id: Option<String>,
    #[prost(bool, optional, tag = "7")]
    pub pin_protection: Option<bool>,
    #[prost(bool, optional, tag = "8")]
    pub passphrase_protection: Option<bool>,
    #[prost(string, optional, tag = "9")]
    pub language: Option<String>,
    #[prost(string, optional, tag = "10")]
    pub label: Option<String>,
    #[prost(bool, optional, tag = "12")]
    pub initialized: Option<bool>,
    #[prost(bytes = "vec", optional, tag = "13")]
    pub revision: Option<Vec<u8>>,
    #[prost(bool, optional, tag = "16")]
    pub unlocked: Option<bool>,
    #[prost(string, optional, tag = "21")]
    pub model: Option<String>,
}

impl Features {
    pub fn version(&self) -> (u32, u32, u32) {
        (
            self.major_version.unwrap_or_default(),
            self.minor_version.unwrap_or_default(),
            self.patch_version.unwrap_or_default(),
        )
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Ping {
    #[prost(string, optional, tag = "1")]
    pub message: Option<String>,
    #[prost(bool, optional, tag = "2")]
    pub button_protection: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Success {
    #[prost(string, optional, tag = "1")]
    pub message: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Failure {
    #[prost(int32, optional, tag = "1")]
    pub code: Option<i32>,
    #[prost(string, optional, tag = "2")]
    pub message: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Cancel {}

#[derive(Clone, PartialEq, Message)]
pub struct ButtonRequest {
    #[prost(int32, optional, tag = "1")]
    pub code: Option<i32>,
    #[prost(uint32, optional, tag = "2")]
    pub pages: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ButtonAck {}

#[derive(Clone, PartialEq, Message)]
pub struct PinMatrixRequest {
    #[prost(int32, optional, tag = "1")]
    pub r#type: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PinMatrixAck {
    #[prost(string, required, tag = "1")]
    pub pin: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PassphraseRequest {
    #[prost(bool, optional, tag = "1")]
    pub on_device: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PassphraseAck {
    #[prost(string, optional, tag = "1")]
    pub passphrase: Option<String>,
    #[prost(bool, optional, tag = "3")]
    pub on_device: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PassphraseStateRequest {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub state: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PassphraseStateAck {}

#[derive(Clone, PartialEq, Message)]
pub struct WordRequest {
    #[prost(int32, optional, tag = "1")]
    pub r#type: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WordAck {
    #[prost(string, required, tag = "1")]
    pub word: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct EntropyRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct EntropyAck {
    #[prost(bytes = "vec", required, tag = "1")]
    pub entropy: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct HdNode {
    #[prost(uint32, required, tag = "1")]
    pub depth: u32,
    #[prost(uint32, required, tag = "2")]
    pub fingerprint: u32,
    #[prost(uint32, required, tag = "3")]
    pub child_num: u32,
    #[prost(bytes = "vec", required, tag = "4")]
    pub chain_code: Vec<u8>,
    #[prost(bytes = "vec", required, tag = "6")]
    pub public_key: Vec<u8>,
}

device_messages!(
    Initialize,
    GetFeatures,
    Features,
    Ping,
    Success,
    Failure,
    Cancel,
    ButtonRequest,
    ButtonAck,
    PinMatrixRequest,
    PinMatrixAck,
    PassphraseRequest,
    PassphraseAck,
    PassphraseStateRequest,
    PassphraseStateAck,
    WordRequest,
    WordAck,
    EntropyRequest,
    EntropyAck,
);
