use thiserror::Error;

pub const PACKET_LEN: usize = 64;
const REPORT_MAGIC: u8 = b'?';
const HEADER_MAGIC: [u8; 3] = [b'?', b'#', b'#'];
const HEADER_LEN: usize = 9; // magic (3) + message type (2) + payload length (4)
/// Payload bytes carried by the first packet of a message.
pub const FIRST_PAYLOAD: usize = PACKET_LEN - HEADER_LEN;
/// Payload bytes carried by each continuation packet.
pub const CONTINUATION_PAYLOAD: usize = PACKET_LEN - 1;
const MAX_PAYLOAD_LEN: usize = 16 << 20; // 16 MiB hard guard.

/// One typed message as it travels on the wire, before schema decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub message_type: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("bad_magic")]
    BadMagic,
    #[error("bad_continuation_magic")]
    BadContinuationMagic,
    #[error("short_packet")]
    ShortPacket,
    #[error("message_too_large")]
    MessageTooLarge,
}

/// Number of packets needed to carry a payload of `payload_len` bytes.
pub fn packet_count(payload_len: usize) -> usize {
    1 + payload_len
        .saturating_sub(FIRST_PAYLOAD)
        .div_ceil(CONTINUATION_PAYLOAD)
}

/// Splits a message into zero-padded 64-byte packets.
pub fn encode_packets(message: &RawMessage) -> Result<Vec<[u8; PACKET_LEN]>, CodecError> {
    if message.payload.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::MessageTooLarge);
    }

    let mut packets = Vec::with_capacity(packet_count(message.payload.len()));

    let mut first = [0u8; PACKET_LEN];
    first[..3].copy_from_slice(&HEADER_MAGIC);
    first[3..5].copy_from_slice(&message.message_type.to_be_bytes());
    first[5..9].copy_from_slice(&(message.payload.len() as u32).to_be_bytes());
    let head_len = message.payload.len().min(FIRST_PAYLOAD);
    first[HEADER_LEN..HEADER_LEN + head_len].copy_from_slice(&message.payload[..head_len]);
    packets.push(first);

    for chunk in message.payload[head_len..].chunks(CONTINUATION_PAYLOAD) {
        let mut packet = [0u8; PACKET_LEN];
        packet[0] = REPORT_MAGIC;
        packet[1..1 + chunk.len()].copy_from_slice(chunk);
        packets.push(packet);
    }

    Ok(packets)
}

#[derive(Debug)]
struct Pending {
    message_type: u16,
    expected_len: usize,
    payload: Vec<u8>,
}

/// Reassembles one message at a time from incoming packets.
///
/// A malformed packet discards whatever was collected so far; the decoder
/// never yields a partial payload.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    pending: Option<Pending>,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self { pending: None }
    }

    /// Whether a message has started but not yet completed.
    pub fn in_progress(&self) -> bool {
        self.pending.is_some()
    }

    pub fn reset(&mut self) {
        self.pending = None;
    }

    /// Feeds one packet. Returns the message once its declared length is
    /// fully consumed.
    pub fn push(&mut self, packet: &[u8]) -> Result<Option<RawMessage>, CodecError> {
        let result = self.push_inner(packet);
        if result.is_err() {
            self.pending = None;
        }
        result
    }

    fn push_inner(&mut self, packet: &[u8]) -> Result<Option<RawMessage>, CodecError> {
        let mut pending = match self.pending.take() {
            None => Self::start(packet)?,
            Some(mut pending) => {
                let Some((&marker, body)) = packet.split_first() else {
                    return Err(CodecError::ShortPacket);
                };
                if marker != REPORT_MAGIC {
                    return Err(CodecError::BadContinuationMagic);
                }
                let remaining = pending.expected_len - pending.payload.len();
                let take = remaining.min(body.len()).min(CONTINUATION_PAYLOAD);
                pending.payload.extend_from_slice(&body[..take]);
                pending
            }
        };

        if pending.payload.len() < pending.expected_len {
            self.pending = Some(pending);
            return Ok(None);
        }

        Ok(Some(RawMessage {
            message_type: pending.message_type,
            payload: std::mem::take(&mut pending.payload),
        }))
    }

    fn start(packet: &[u8]) -> Result<Pending, CodecError> {
        if packet.len() < HEADER_LEN {
            return Err(CodecError::ShortPacket);
        }
        if packet[..3] != HEADER_MAGIC {
            return Err(CodecError::BadMagic);
        }
        let message_type = u16::from_be_bytes([packet[3], packet[4]]);
        let expected_len =
            u32::from_be_bytes([packet[5], packet[6], packet[7], packet[8]]) as usize;
        if expected_len > MAX_PAYLOAD_LEN {
            return Err(CodecError::MessageTooLarge);
        }

        let body = &packet[HEADER_LEN..];
        let take = expected_len.min(body.len()).min(FIRST_PAYLOAD);
        let mut payload = Vec::with_capacity(expected_len);
        payload.extend_from_slice(&body[..take]);
        Ok(Pending {
            message_type,
            expected_len,
            payload,
        })
    }
}
