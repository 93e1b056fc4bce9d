//! The adapter between a connection's transport events and a [`ProtocolListener`].
//!
//! [`ProtocolHandler`] forwards every event to the listener untouched. Around that it does two things: it
//! logs traffic (heartbeats excepted, large payloads shortened), and it contains faults. A listener panic or a
//! protocol error ends up in [`ProtocolHandler::exception_caught`], which logs it and closes the connection.
//! The fault never reaches another connection.

use std::{fmt, panic::AssertUnwindSafe, sync::Arc};

use tracing::{debug, warn, Level};

use crate::{
    connection::Connection, error::ConnectionFault, listener::ProtocolListener,
    message::MultiplexerMessage,
};

/// Forwards connection events to a shared listener, containing faults per connection.
pub struct ProtocolHandler<L> {
    listener: Arc<L>,
}

impl<L: ProtocolListener> ProtocolHandler<L> {
    /// Creates a handler forwarding to `listener`.
    pub fn new(listener: Arc<L>) -> Self {
        ProtocolHandler { listener }
    }

    /// The listener events are forwarded to.
    pub fn listener(&self) -> &Arc<L> {
        &self.listener
    }

    /// The connection was registered with the transport.
    pub fn channel_open(&self, connection: &Connection) {
        self.dispatch(connection, |listener| listener.channel_open(connection));
    }

    /// The connection is established.
    pub fn channel_connected(&self, connection: &Connection) {
        debug!(%connection, "connected");
        self.dispatch(connection, |listener| listener.channel_connected(connection));
    }

    /// The connection closed.
    pub fn channel_disconnected(&self, connection: &Connection) {
        debug!(%connection, "disconnected");
        self.dispatch(connection, |listener| {
            listener.channel_disconnected(connection)
        });
    }

    /// A message was decoded from the connection.
    ///
    /// The listener always receives the message as decoded. Only the logged copy is shortened.
    pub fn message_received(&self, message: MultiplexerMessage, connection: &Connection) {
        if !message.is_heartbeat() && tracing::enabled!(Level::DEBUG) {
            debug!(%connection, message = ?message.short_debug(), "received");
        }
        self.dispatch(connection, move |listener| {
            listener.message_received(message, connection)
        });
    }

    /// A message is about to be written to the connection.
    pub fn write_requested(&self, message: &MultiplexerMessage, connection: &Connection) {
        if !message.is_heartbeat() && tracing::enabled!(Level::DEBUG) {
            debug!(%connection, message = ?message.short_debug(), "writing");
        }
    }

    /// A fault occurred while processing the connection. Logs it and closes the connection.
    pub fn exception_caught(&self, connection: &Connection, fault: ConnectionFault) {
        warn!(
            %connection,
            open = connection.is_open(),
            listener = %self.listener.name(),
            error = %fault,
            "closing connection after fault"
        );
        connection.close();
    }

    fn dispatch<F>(&self, connection: &Connection, f: F)
    where
        F: FnOnce(&L),
    {
        let listener = &*self.listener;
        if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| f(listener))) {
            self.exception_caught(connection, ConnectionFault::from_panic(payload));
        }
    }
}

impl<L> Clone for ProtocolHandler<L> {
    fn clone(&self) -> Self {
        ProtocolHandler {
            listener: Arc::clone(&self.listener),
        }
    }
}

impl<L: ProtocolListener> fmt::Debug for ProtocolHandler<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolHandler")
            .field("listener", &self.listener.name())
            .finish()
    }
}
