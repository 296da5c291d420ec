//! Transport trait abstraction for pluggable link backends

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// A byte-stream session with a peripheral
#[async_trait]
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug + 'static {
    /// Close the stream gracefully
    async fn shutdown(&mut self) -> std::io::Result<()>;
}

/// One connection strategy tried by the establisher
#[async_trait]
pub trait ConnectStrategy: Send + Sync {
    /// Attempt a full connect-and-verify against the target address.
    /// A failed attempt must not leak a partially-opened handle.
    async fn establish(&self, address: &str, timeout: Duration) -> Result<Box<dyn TransportStream>>;

    /// Human-readable name for logs
    fn name(&self) -> &'static str;
}

/// Produces an open byte-stream session for an address
#[async_trait]
pub trait Establish: Send + Sync {
    async fn establish(&self, address: &str, timeout: Duration) -> Result<Box<dyn TransportStream>>;
}

#[cfg(test)]
#[async_trait]
impl TransportStream for tokio::io::DuplexStream {
    async fn shutdown(&mut self) -> std::io::Result<()> {
        tokio::io::AsyncWriteExt::shutdown(self).await
    }
}
