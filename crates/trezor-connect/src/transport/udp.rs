use std::io;
use std::time::Duration;

use async_trait::async_trait;
use hw_codec::PACKET_LEN;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::debug;

use crate::link::{Link, LinkError};

pub const DEFAULT_EMULATOR_ADDRESS: &str = "127.0.0.1:21324";
const PING: &[u8] = b"PINGPING";
const PONG: &[u8] = b"PONGPONG";

/// Datagram link to a device emulator: one 64-byte packet per datagram.
pub struct UdpLink {
    socket: UdpSocket,
    open: bool,
}

impl UdpLink {
    pub async fn connect(address: &str) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        socket.connect(address).await?;
        debug!(%address, "UDP link connected");
        Ok(Self { socket, open: true })
    }

    /// Emulator liveness probe; `Ok(false)` when nothing answered in time.
    pub async fn probe(&mut self, timeout: Duration) -> Result<bool, LinkError> {
        self.socket.send(PING).await.map_err(map_io)?;
        let mut buffer = [0u8; PACKET_LEN];
        match time::timeout(timeout, self.socket.recv(&mut buffer)).await {
            Ok(Ok(len)) => Ok(&buffer[..len] == PONG),
            Ok(Err(error)) => Err(map_io(error)),
            Err(_) => Ok(false),
        }
    }
}

fn map_io(error: io::Error) -> LinkError {
    match error.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => {
            LinkError::Disconnected
        }
        _ => LinkError::Io(error),
    }
}

#[async_trait]
impl Link for UdpLink {
    async fn write(&mut self, packet: &[u8]) -> Result<(), LinkError> {
        if !self.open {
            return Err(LinkError::Closed);
        }
        self.socket.send(packet).await.map_err(map_io)?;
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<u8>, LinkError> {
        if !self.open {
            return Err(LinkError::Closed);
        }
        let mut buffer = [0u8; PACKET_LEN];
        loop {
            let len = self.socket.recv(&mut buffer).await.map_err(map_io)?;
            // Late answers to a liveness probe share the socket.
            if &buffer[..len] == PONG {
                continue;
            }
            return Ok(buffer[..len].to_vec());
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        self.open = false;
        Ok(())
    }
}
