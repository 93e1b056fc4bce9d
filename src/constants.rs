//! Symbolic names for peer types and message types.
//!
//! Peer types and message types travel as plain integers. Deployments give them names in a rules file that is
//! loaded once at startup into an immutable [`Constants`] table and shared by reference. The multiplexer core
//! never validates integers against the table: any `i32` is a valid peer or message type on the wire.

use std::collections::{hash_map::Entry, HashMap};

use once_cell::sync::Lazy;

use crate::{error::ConstantsError, MessageType, PeerType};

/// Peer types reserved by the multiplexer itself.
pub mod peer_types {
    use crate::PeerType;

    /// The multiplexer (broker) process.
    pub const MULTIPLEXER: PeerType = 1;
    /// Wildcard meaning every peer type.
    pub const ALL_TYPES: PeerType = 2;
    /// Peer types up to this value are reserved for the multiplexer.
    pub const MAX_MULTIPLEXER_SPECIAL_PEER_TYPE: PeerType = 99;
}

/// Message types reserved by the multiplexer itself.
pub mod message_types {
    use crate::MessageType;

    /// First message on every connection, carrying a [`WelcomeMessage`](crate::message::WelcomeMessage).
    pub const CONNECTION_WELCOME: MessageType = 1;
    /// Asks the multiplexer for a backend able to handle a packet.
    pub const BACKEND_FOR_PACKET_SEARCH: MessageType = 2;
    /// Liveness signal, sent periodically in both directions.
    pub const HEARTBEAT: MessageType = 3;
    /// Reports that a message could not be delivered.
    pub const DELIVERY_ERROR: MessageType = 4;
    /// Reports that a backend failed to handle a request.
    pub const BACKEND_ERROR: MessageType = 5;
    /// Round-trip check answered by the receiver.
    pub const PING: MessageType = 6;
    /// Acknowledges that a request reached a backend.
    pub const REQUEST_RECEIVED: MessageType = 7;
    /// Message types up to this value are reserved for the multiplexer.
    pub const MAX_MULTIPLEXER_META_PACKET: MessageType = 99;
}

static SYSTEM_CONSTANTS: Lazy<Constants> = Lazy::new(|| {
    use message_types::*;
    use peer_types::*;

    let mut builder = Constants::builder();
    for (name, value) in [
        ("MULTIPLEXER", MULTIPLEXER),
        ("ALL_TYPES", ALL_TYPES),
        (
            "MAX_MULTIPLEXER_SPECIAL_PEER_TYPE",
            MAX_MULTIPLEXER_SPECIAL_PEER_TYPE,
        ),
    ] {
        builder.insert_peer_type(name, value);
    }
    for (name, value) in [
        ("CONNECTION_WELCOME", CONNECTION_WELCOME),
        ("BACKEND_FOR_PACKET_SEARCH", BACKEND_FOR_PACKET_SEARCH),
        ("HEARTBEAT", HEARTBEAT),
        ("DELIVERY_ERROR", DELIVERY_ERROR),
        ("BACKEND_ERROR", BACKEND_ERROR),
        ("PING", PING),
        ("REQUEST_RECEIVED", REQUEST_RECEIVED),
        ("MAX_MULTIPLEXER_META_PACKET", MAX_MULTIPLEXER_META_PACKET),
    ] {
        builder.insert_message_type(name, value);
    }
    builder
        .build()
        .unwrap_or_else(|err| unreachable!("system constants are unique: {err}"))
});

/// An immutable two-way mapping between names and integers for peer types and message types.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Constants {
    peer_types: Table,
    message_types: Table,
}

impl Constants {
    /// Returns a builder for a new table.
    pub fn builder() -> ConstantsBuilder {
        ConstantsBuilder::default()
    }

    /// The table of constants reserved by the multiplexer.
    pub fn system() -> &'static Constants {
        &SYSTEM_CONSTANTS
    }

    /// Returns a builder pre-filled with this table's entries, to extend it.
    pub fn to_builder(&self) -> ConstantsBuilder {
        ConstantsBuilder {
            peer_types: self.peer_types.iter().map(|(n, v)| (n.to_owned(), v)).collect(),
            message_types: self
                .message_types
                .iter()
                .map(|(n, v)| (n.to_owned(), v))
                .collect(),
        }
    }

    /// Looks up a peer type by name.
    pub fn peer_type(&self, name: &str) -> Option<PeerType> {
        self.peer_types.value(name)
    }

    /// Looks up the name of a peer type.
    pub fn peer_type_name(&self, value: PeerType) -> Option<&str> {
        self.peer_types.name(value)
    }

    /// Looks up a message type by name.
    pub fn message_type(&self, name: &str) -> Option<MessageType> {
        self.message_types.value(name)
    }

    /// Looks up the name of a message type.
    pub fn message_type_name(&self, value: MessageType) -> Option<&str> {
        self.message_types.name(value)
    }

    /// All peer types, in arbitrary order.
    pub fn peer_types(&self) -> impl Iterator<Item = (&str, PeerType)> {
        self.peer_types.iter()
    }

    /// All message types, in arbitrary order.
    pub fn message_types(&self) -> impl Iterator<Item = (&str, MessageType)> {
        self.message_types.iter()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Table {
    by_name: HashMap<String, i32>,
    by_value: HashMap<i32, String>,
}

impl Table {
    fn build(kind: &'static str, entries: Vec<(String, i32)>) -> Result<Self, ConstantsError> {
        let mut table = Table::default();
        for (name, value) in entries {
            match table.by_value.entry(value) {
                Entry::Occupied(entry) => {
                    return Err(if entry.get() == &name {
                        ConstantsError::DuplicateName { kind, name }
                    } else {
                        ConstantsError::DuplicateValue {
                            kind,
                            value,
                            first: entry.get().clone(),
                            second: name,
                        }
                    });
                }
                Entry::Vacant(entry) => {
                    if table.by_name.contains_key(&name) {
                        return Err(ConstantsError::DuplicateName { kind, name });
                    }
                    entry.insert(name.clone());
                    table.by_name.insert(name, value);
                }
            }
        }
        Ok(table)
    }

    fn value(&self, name: &str) -> Option<i32> {
        self.by_name.get(name).copied()
    }

    fn name(&self, value: i32) -> Option<&str> {
        self.by_value.get(&value).map(String::as_str)
    }

    fn iter(&self) -> impl Iterator<Item = (&str, i32)> {
        self.by_name.iter().map(|(name, value)| (name.as_str(), *value))
    }
}

/// Collects named constants and checks them for uniqueness.
#[derive(Clone, Debug, Default)]
pub struct ConstantsBuilder {
    peer_types: Vec<(String, PeerType)>,
    message_types: Vec<(String, MessageType)>,
}

impl ConstantsBuilder {
    /// Adds a named peer type.
    pub fn peer_type(mut self, name: impl Into<String>, value: PeerType) -> Self {
        self.insert_peer_type(name, value);
        self
    }

    /// Adds a named message type.
    pub fn message_type(mut self, name: impl Into<String>, value: MessageType) -> Self {
        self.insert_message_type(name, value);
        self
    }

    /// Adds a named peer type in place.
    pub fn insert_peer_type(&mut self, name: impl Into<String>, value: PeerType) {
        self.peer_types.push((name.into(), value));
    }

    /// Adds a named message type in place.
    pub fn insert_message_type(&mut self, name: impl Into<String>, value: MessageType) {
        self.message_types.push((name.into(), value));
    }

    /// Builds the table.
    ///
    /// Fails if a name or a value appears twice within the peer types or within the message types.
    /// The same integer may name both a peer type and a message type.
    pub fn build(self) -> Result<Constants, ConstantsError> {
        Ok(Constants {
            peer_types: Table::build("peer type", self.peer_types)?,
            message_types: Table::build("message type", self.message_types)?,
        })
    }
}
