//! Packet framing for the Trezor v1 wire protocol (USB HID and emulator socket).

pub mod frame;

pub use frame::{
    encode_packets, packet_count, CodecError, MessageDecoder, RawMessage, CONTINUATION_PAYLOAD,
    FIRST_PAYLOAD, PACKET_LEN,
};
