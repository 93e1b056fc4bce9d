//! Defines error handling constructs for the multiplexer.
//!
//! Errors fall into a few families. Protocol violations ([`FrameError`], [`ProtocolError`]) are fatal for the
//! connection they occur on. Routing misses ([`RegistryError`]) are ordinary outcomes handed back to the caller.
//! Outbound queue failures ([`ConnectionError`]) are reported to whoever tried to write. Anything that reaches the
//! protocol handler's fault path is wrapped in a [`ConnectionFault`].

use std::{any::Any, borrow::Cow, io};

use crate::{connection::ConnectionId, PeerId, PeerType};

/// A violation of the frame layer of the wire protocol.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The length header was negative.
    #[error("frame length must be positive, not {0}")]
    NegativeLength(i32),
    /// The declared or requested frame length exceeds the configured maximum.
    #[error("frame length must be at most {max}, not {length}")]
    FrameTooLong {
        /// Length found in the header, or the size of the payload being encoded.
        length: usize,
        /// Maximum length accepted by the codec.
        max: usize,
    },
    /// The payload does not match the checksum carried in the header.
    #[error("frame of length {length} with invalid checksum {expected:#010x} (computed {actual:#010x})")]
    ChecksumMismatch {
        /// Payload length.
        length: usize,
        /// Checksum read from the header.
        expected: u32,
        /// Checksum computed over the received payload.
        actual: u32,
    },
    /// An I/O error from the underlying stream.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Error produced while turning bytes into [`MultiplexerMessage`](crate::message::MultiplexerMessage)s and back.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame layer rejected the stream.
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// A frame could not be deserialized into a message.
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    /// A message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    /// An I/O error from the underlying stream.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A routing miss returned by the [`ConnectionRegistry`](crate::registry::ConnectionRegistry).
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No open connection is registered for the peer type.
    #[error("no peer for type {0}")]
    NoPeerForType(PeerType),
    /// No connection is registered for the peer id.
    #[error("no peer for id {0}")]
    NoPeerForId(PeerId),
}

/// Error returned when queueing an outbound message on a [`Connection`](crate::connection::Connection).
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The connection is closed.
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
    /// The outbound queue is full.
    #[error("outbound queue of connection {0} is full")]
    Full(ConnectionId),
}

/// A fault caught while processing events of a single connection.
///
/// Faults are always fatal for the connection and never for anything else.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionFault {
    /// The peer violated the wire protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The transport failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// A listener callback panicked.
    #[error("listener panicked: {0}")]
    Panicked(Cow<'static, str>),
}

impl ConnectionFault {
    /// Builds a [`ConnectionFault::Panicked`] from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let msg = match payload.downcast::<&'static str>() {
            Ok(s) => Cow::Borrowed(*s),
            Err(payload) => match payload.downcast::<String>() {
                Ok(s) => Cow::Owned(*s),
                Err(_) => Cow::Borrowed("<non-string panic payload>"),
            },
        };
        ConnectionFault::Panicked(msg)
    }
}

impl From<FrameError> for ConnectionFault {
    fn from(err: FrameError) -> Self {
        ConnectionFault::Protocol(ProtocolError::Frame(err))
    }
}

/// Error returned when building a [`Constants`](crate::constants::Constants) table.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConstantsError {
    /// The same name was registered twice in one namespace.
    #[error("duplicate {kind} name `{name}`")]
    DuplicateName {
        /// Namespace, `peer type` or `message type`.
        kind: &'static str,
        /// The repeated name.
        name: String,
    },
    /// Two names were given the same value in one namespace.
    #[error("{kind} value {value} used by both `{first}` and `{second}`")]
    DuplicateValue {
        /// Namespace, `peer type` or `message type`.
        kind: &'static str,
        /// The repeated value.
        value: i32,
        /// Name registered first.
        first: String,
        /// Name registered second.
        second: String,
    },
}
