use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hw_codec::PACKET_LEN;
use rusb::{DeviceHandle, GlobalContext};
use tracing::{debug, warn};

use crate::link::{Link, LinkError};

pub const TREZOR_VID: u16 = 0x1209;
pub const TREZOR_PID: u16 = 0x53c1;
pub const TREZOR_BOOTLOADER_PID: u16 = 0x53c0;

const ENDPOINT_OUT: u8 = 0x01;
const ENDPOINT_IN: u8 = 0x81;

/// WebUSB interrupt-endpoint link. Transfers run on the blocking pool.
pub struct UsbLink {
    handle: Arc<DeviceHandle<GlobalContext>>,
    interface: u8,
    timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl UsbLink {
    /// Opens the first attached device matching `vendor_id:product_id` and
    /// claims `interface`.
    pub fn open(
        vendor_id: u16,
        product_id: u16,
        interface: u8,
        timeout: Duration,
    ) -> Result<Self, LinkError> {
        let mut handle = rusb::open_device_with_vid_pid(vendor_id, product_id)
            .ok_or(LinkError::Disconnected)?;
        if rusb::supports_detach_kernel_driver() {
            if let Err(error) = handle.set_auto_detach_kernel_driver(true) {
                warn!(%error, "failed to enable kernel driver auto-detach");
            }
        }
        handle.claim_interface(interface).map_err(map_usb)?;
        debug!(
            vendor_id = format_args!("{vendor_id:04x}"),
            product_id = format_args!("{product_id:04x}"),
            interface,
            "USB link opened"
        );
        Ok(Self {
            handle: Arc::new(handle),
            interface,
            timeout,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn ensure_open(&self) -> Result<(), LinkError> {
        if self.closed.load(Ordering::Acquire) {
            Err(LinkError::Closed)
        } else {
            Ok(())
        }
    }
}

fn map_usb(error: rusb::Error) -> LinkError {
    match error {
        rusb::Error::NoDevice | rusb::Error::NotFound => LinkError::Disconnected,
        rusb::Error::Timeout | rusb::Error::Pipe => LinkError::Stalled,
        other => LinkError::Io(io::Error::other(other)),
    }
}

fn map_join(error: tokio::task::JoinError) -> LinkError {
    LinkError::Io(io::Error::other(error))
}

#[async_trait]
impl Link for UsbLink {
    async fn write(&mut self, packet: &[u8]) -> Result<(), LinkError> {
        self.ensure_open()?;
        let handle = Arc::clone(&self.handle);
        let timeout = self.timeout;
        let packet = packet.to_vec();
        tokio::task::spawn_blocking(move || {
            handle
                .write_interrupt(ENDPOINT_OUT, &packet, timeout)
                .map_err(map_usb)
        })
        .await
        .map_err(map_join)??;
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<u8>, LinkError> {
        self.ensure_open()?;
        let handle = Arc::clone(&self.handle);
        let closed = Arc::clone(&self.closed);
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || {
            let mut buffer = [0u8; PACKET_LEN];
            // The device may sit on a prompt indefinitely; poll until it answers.
            loop {
                if closed.load(Ordering::Acquire) {
                    return Err(LinkError::Closed);
                }
                match handle.read_interrupt(ENDPOINT_IN, &mut buffer, timeout) {
                    Ok(0) => continue,
                    Ok(len) => return Ok(buffer[..len].to_vec()),
                    Err(rusb::Error::Timeout) => continue,
                    Err(error) => return Err(map_usb(error)),
                }
            }
        })
        .await
        .map_err(map_join)?
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let handle = Arc::clone(&self.handle);
        let interface = self.interface;
        tokio::task::spawn_blocking(move || {
            if let Err(error) = handle.release_interface(interface) {
                warn!(%error, "failed to release USB interface");
            }
        })
        .await
        .map_err(map_join)
    }
}
