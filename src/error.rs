//! Custom error types for the collector stages.
//!
//! This module defines `CollectorError`, the single error type shared by the transport,
//! the connection abstractions and the collector apps. Using the `thiserror` crate, it
//! gives every failure a stable variant so callers can decide what is fatal.
//!
//! ## Error Hierarchy
//!
//! - **Transport errors** (`Io`, `Bind`, `PeerNotConnected`, `NoPeers`, `TransportClosed`):
//!   a send or receive failed on a socket. These are always reported to the caller. For a
//!   `ConfirmedConnection`, a failed confirmation send is attached to the delivered message
//!   instead of replacing it.
//! - **Protocol errors** (`Decode`, `UnexpectedMessage`, `EmptyPayload`, `PayloadTooLarge`): malformed or
//!   out-of-place frames. Collectors log these and keep running.
//! - **Configuration errors** (`Config`, `Configuration`, `InvalidAddress`): raised while
//!   loading or validating `CollectorConfig`; fatal at startup.
//!
//! "No ready worker" is deliberately *not* an error: it is the
//! [`DispatchOutcome::Backpressure`](crate::connection::DispatchOutcome) control-flow result.

use crate::message::MessageKind;
use thiserror::Error;

/// Convenience alias for results using the collector error type.
pub type CollectorResult<T> = std::result::Result<T, CollectorError>;

/// Primary error type for collector stages.
#[derive(Error, Debug)]
pub enum CollectorError {
    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Endpoint string is not `inproc://name` or `tcp://host:port`.
    #[error("Invalid endpoint address '{0}'")]
    InvalidAddress(String),

    /// Socket could not be bound or connected.
    #[error("Failed to bind {address}: {reason}")]
    Bind {
        /// Endpoint that failed.
        address: String,
        /// Underlying cause.
        reason: String,
    },

    /// I/O failure on a TCP stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Send targeted a peer this socket does not (or no longer) know.
    #[error("Peer '{0}' is not connected")]
    PeerNotConnected(String),

    /// Broadcast or raw send with no peer attached.
    #[error("No peer connected to {0}")]
    NoPeers(String),

    /// The socket's event channel has been closed.
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// Frame could not be decoded into a message.
    #[error("Failed to decode message: {0}")]
    Decode(String),

    /// Data messages must carry a payload.
    #[error("Data message payload must not be empty")]
    EmptyPayload,

    /// A payload or frame too long for its `u32` length prefix.
    #[error("Payload of {0} bytes does not fit a u32 length prefix")]
    PayloadTooLarge(usize),

    /// Message kind is not valid on this connection.
    #[error("Unexpected {kind} message from '{peer}'")]
    UnexpectedMessage {
        /// Kind that was received.
        kind: MessageKind,
        /// Sender identity.
        peer: String,
    },
}

impl From<figment::Error> for CollectorError {
    fn from(value: figment::Error) -> Self {
        CollectorError::Config(Box::new(value))
    }
}

impl CollectorError {
    /// Whether the stage can keep running after this error.
    ///
    /// Only setup failures are fatal; everything observed while the event loop
    /// runs is reported and the loop continues.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            CollectorError::Config(_)
                | CollectorError::Configuration(_)
                | CollectorError::InvalidAddress(_)
                | CollectorError::Bind { .. }
        )
    }
}
