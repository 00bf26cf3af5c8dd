//! Scripted in-memory device for exercising the session and signers through
//! real framing.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use hw_codec::{encode_packets, MessageDecoder, RawMessage};
use parking_lot::Mutex;

use crate::link::{Link, LinkError};
use crate::messages::DeviceMessage;
use crate::registry::MessageRegistry;

/// Encodes `message` as the device would send it.
pub(crate) fn reply<M: DeviceMessage>(message: &M) -> RawMessage {
    MessageRegistry::trezor()
        .encode(message)
        .expect("message in schema")
}

struct Step {
    expect: &'static str,
    replies: Vec<RawMessage>,
}

#[derive(Default)]
struct MockState {
    inbound: MessageDecoder,
    received: Vec<RawMessage>,
    written: Vec<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
    script: VecDeque<Step>,
    stalled_writes: usize,
    disconnected: bool,
    closed: bool,
}

#[derive(Clone, Default)]
pub(crate) struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    /// On the next complete host message, which must be `Req`, queue `replies`.
    pub(crate) fn on<Req: DeviceMessage>(&self, replies: Vec<RawMessage>) -> &Self {
        self.state.lock().script.push_back(Step {
            expect: Req::NAME,
            replies,
        });
        self
    }

    pub(crate) fn queue_message(&self, message: &RawMessage) {
        let packets = encode_packets(message).expect("encode packets");
        let mut state = self.state.lock();
        for packet in packets {
            state.outbound.push_back(packet.to_vec());
        }
    }

    pub(crate) fn queue_packet(&self, packet: Vec<u8>) {
        self.state.lock().outbound.push_back(packet);
    }

    pub(crate) fn stall_writes(&self, count: usize) {
        self.state.lock().stalled_writes = count;
    }

    pub(crate) fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }

    pub(crate) fn written_packets(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    pub(crate) fn received(&self) -> Vec<RawMessage> {
        self.state.lock().received.clone()
    }

    /// Names of every complete message the host sent, in order.
    pub(crate) fn received_names(&self) -> Vec<&'static str> {
        let registry = MessageRegistry::trezor();
        self.received()
            .iter()
            .map(|raw| registry.name_of(raw.message_type).expect("known type"))
            .collect()
    }

    /// The `index`-th host message of type `M`.
    pub(crate) fn received_as<M: DeviceMessage>(&self, index: usize) -> M {
        let registry = MessageRegistry::trezor();
        let code = registry.type_code_of(M::NAME).expect("known type");
        let raw = self
            .received()
            .into_iter()
            .filter(|raw| raw.message_type == code)
            .nth(index)
            .expect("message received");
        registry.decode(&raw).expect("decode")
    }

    pub(crate) fn script_exhausted(&self) -> bool {
        self.state.lock().script.is_empty()
    }
}

#[async_trait]
impl Link for MockDevice {
    async fn write(&mut self, packet: &[u8]) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(LinkError::Disconnected);
        }
        if state.closed {
            return Err(LinkError::Closed);
        }
        if state.stalled_writes > 0 {
            state.stalled_writes -= 1;
            return Err(LinkError::Stalled);
        }
        state.written.push(packet.to_vec());

        let Some(message) = state.inbound.push(packet).expect("host sent a valid packet") else {
            return Ok(());
        };
        state.received.push(message.clone());

        if let Some(step) = state.script.pop_front() {
            let name = MessageRegistry::trezor()
                .name_of(message.message_type)
                .expect("known type");
            assert_eq!(name, step.expect, "host sent an unexpected message");
            for reply in &step.replies {
                for packet in encode_packets(reply).expect("encode packets") {
                    state.outbound.push_back(packet.to_vec());
                }
            }
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<u8>, LinkError> {
        // Give concurrently polled futures a turn, like a real transfer would.
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        if state.closed {
            return Err(LinkError::Closed);
        }
        if state.disconnected {
            return Err(LinkError::Disconnected);
        }
        match state.outbound.pop_front() {
            Some(packet) => Ok(packet),
            // Nothing left to say: the device is gone.
            None => Err(LinkError::Disconnected),
        }
    }

    fn is_open(&self) -> bool {
        let state = self.state.lock();
        !state.closed && !state.disconnected
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        self.state.lock().closed = true;
        Ok(())
    }
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .compact()
        .try_init();
}
