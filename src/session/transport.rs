//! Byte stream abstraction for the broker connection

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream to the broker
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opens connections to the source broker.
///
/// The session manager calls this once per connection attempt, including
/// every reconnect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> std::io::Result<Box<dyn Stream>>;
}
