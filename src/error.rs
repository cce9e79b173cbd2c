//! Error types for the streaming engine.

use std::io;

/// Result type alias
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failures while establishing a byte stream.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Port {0} is already in use. Close the other instance and retry.")]
    AddressInUse(u16),

    #[error("Connection to {0} timed out")]
    Timeout(String),

    #[error("Peer {addr} unreachable: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Transport not supported in this build: {0}")]
    Unsupported(&'static str),

    #[error("USB port forwarding failed: {0}")]
    PortForward(String),

    #[error("Bluetooth error: {0}")]
    Bluetooth(String),

    #[error("Listener error: {0}")]
    Listen(#[from] io::Error),
}

/// Failures in the handshake and framing layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Handshake failed: expected {expected:?}, got {actual:?}")]
    HandshakeMismatch { expected: String, actual: String },

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Payload decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Unknown sample format tag {0}")]
    UnknownFormat(i32),

    #[error("Field out of range: {0}")]
    OutOfRange(&'static str),

    #[error("Message carries no content")]
    Empty,
}

/// Session-level error surfaced through the engine's last-error stream.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Audio device error: {0:#}")]
    Device(anyhow::Error),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    /// Peer closed, reset or broken pipe. These end a session without an error report.
    pub fn is_expected_disconnect(&self) -> bool {
        match self {
            EngineError::Disconnected => true,
            EngineError::Io(e) => is_disconnect_kind(e.kind()),
            _ => false,
        }
    }
}

pub fn is_disconnect_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}
