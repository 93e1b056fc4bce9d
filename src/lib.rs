#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod frame;
pub mod handler;
pub mod listener;
pub mod message;
pub mod registry;
pub mod transport;

pub use config::{ByteOrder, ConnectionConfig};
pub use connection::{Connection, ConnectionId};
pub use constants::Constants;
pub use frame::FrameCodec;
pub use handler::ProtocolHandler;
pub use listener::ProtocolListener;
pub use message::{MessageCodec, MultiplexerMessage, WelcomeMessage};
pub use registry::{ConnectionRegistry, PeerGroup};
pub use transport::{connect, spawn_connection, Server};

/// Identifier of a peer process, chosen by the peer and announced in its welcome message.
pub type PeerId = u64;

/// Classification of a peer, used to route messages to any peer of a kind.
pub type PeerType = i32;

/// Kind of a [`MultiplexerMessage`].
pub type MessageType = i32;
