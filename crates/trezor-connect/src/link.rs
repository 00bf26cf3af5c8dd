use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("device disconnected")]
    Disconnected,
    #[error("transfer stalled")]
    Stalled,
    #[error("link closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A raw packet channel to one device.
///
/// Each `write` carries exactly one 64-byte packet and each `read` yields one.
#[async_trait]
pub trait Link: Send {
    async fn write(&mut self, packet: &[u8]) -> Result<(), LinkError>;

    async fn read(&mut self) -> Result<Vec<u8>, LinkError>;

    fn is_open(&self) -> bool;

    async fn close(&mut self) -> Result<(), LinkError>;
}

#[async_trait]
impl<L: Link + ?Sized> Link for Box<L> {
    async fn write(&mut self, packet: &[u8]) -> Result<(), LinkError> {
        (**self).write(packet).await
    }

    async fn read(&mut self) -> Result<Vec<u8>, LinkError> {
        (**self).read().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        (**self).close().await
    }
}
