//! Framed message transport over a packet [`Link`].

mod udp;
#[cfg(feature = "usb")]
mod usb;

pub use udp::{UdpLink, DEFAULT_EMULATOR_ADDRESS};
#[cfg(feature = "usb")]
pub use usb::{UsbLink, TREZOR_BOOTLOADER_PID, TREZOR_PID, TREZOR_VID};

use hw_codec::{encode_packets, MessageDecoder, RawMessage};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::{DeviceError, Result};
use crate::link::{Link, LinkError};

/// Owns one link and moves whole messages across it.
pub struct Transport<L> {
    link: L,
    decoder: MessageDecoder,
    open: bool,
    disconnected: watch::Sender<bool>,
}

impl<L: Link> Transport<L> {
    pub fn new(link: L) -> Self {
        let (disconnected, _) = watch::channel(false);
        Self {
            link,
            decoder: MessageDecoder::new(),
            open: true,
            disconnected,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open && self.link.is_open()
    }

    /// Flips to `true` once the device goes away.
    pub fn disconnect_notifications(&self) -> watch::Receiver<bool> {
        self.disconnected.subscribe()
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub async fn send(&mut self, message: &RawMessage) -> Result<()> {
        let packets = encode_packets(message)?;
        trace!(
            message_type = message.message_type,
            payload_len = message.payload.len(),
            packets = packets.len(),
            "transport send"
        );
        for packet in &packets {
            self.write_packet(packet).await?;
        }
        Ok(())
    }

    pub async fn receive(&mut self) -> Result<RawMessage> {
        self.decoder.reset();
        loop {
            let packet = self.read_packet().await?;
            if let Some(message) = self.decoder.push(&packet)? {
                trace!(
                    message_type = message.message_type,
                    payload_len = message.payload.len(),
                    "transport receive"
                );
                return Ok(message);
            }
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        self.open = false;
        self.link.close().await.map_err(DeviceError::from)
    }

    async fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        let result = self.link.write(packet).await;
        match result {
            Err(LinkError::Stalled) => {
                debug!("packet write stalled, retrying once");
                self.link
                    .write(packet)
                    .await
                    .map_err(|error| self.link_failed(error))
            }
            other => other.map_err(|error| self.link_failed(error)),
        }
    }

    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let result = self.link.read().await;
        match result {
            Err(LinkError::Stalled) => {
                debug!("packet read stalled, retrying once");
                self.link.read().await.map_err(|error| self.link_failed(error))
            }
            other => other.map_err(|error| self.link_failed(error)),
        }
    }

    fn link_failed(&mut self, error: LinkError) -> DeviceError {
        match error {
            LinkError::Disconnected | LinkError::Closed => {
                if self.open {
                    warn!(%error, "device link lost");
                    self.open = false;
                    self.disconnected.send_replace(true);
                }
                DeviceError::DeviceDisconnected
            }
            other => DeviceError::Transport(other),
        }
    }
}
