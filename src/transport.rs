//! Byte-stream establishment over TCP, USB-tunneled TCP and Bluetooth RFCOMM.
//!
//! Everything above this layer sees a [`Connection`]: a boxed duplex stream
//! plus a printable peer name. Failures are reported, never retried here.

pub mod adb;
pub mod bluetooth;
pub mod tcp;

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{ConnectionConfig, TransportKind};
use crate::error::TransportError;

/// Any duplex byte stream a session can run on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

/// An established stream.
pub struct Connection {
    pub stream: BoxStream,
    pub peer: String,
}

impl Connection {
    pub fn new<S: AsyncStream>(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            peer: peer.into(),
        }
    }
}

/// Consumer-side source of incoming connections.
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next peer.
    async fn accept(&mut self) -> Result<Connection, TransportError>;

    /// Where this listener can be reached, for logs.
    fn local_description(&self) -> String;
}

/// Open a stream to the consumer described by `config`.
pub async fn connect(
    config: &ConnectionConfig,
    timeout: Duration,
) -> Result<Connection, TransportError> {
    match config.transport {
        TransportKind::Wifi => tcp::connect(&config.address, config.port, timeout).await,
        TransportKind::Usb => tcp::connect(tcp::LOOPBACK, config.port, timeout).await,
        TransportKind::Bluetooth => bluetooth::connect(&config.address, timeout).await,
    }
}

/// Start listening for producers.
///
/// USB mode binds the loopback port that `adb reverse` forwards to; the
/// forwarding itself is set up separately by [`adb::reverse_port`].
pub async fn bind(config: &ConnectionConfig) -> Result<Box<dyn Listener>, TransportError> {
    match config.transport {
        TransportKind::Wifi => Ok(Box::new(tcp::TcpServer::bind("0.0.0.0", config.port).await?)),
        TransportKind::Usb => Ok(Box::new(tcp::TcpServer::bind(tcp::LOOPBACK, config.port).await?)),
        TransportKind::Bluetooth => bluetooth::listen().await,
    }
}
