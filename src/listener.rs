//! The callbacks through which an application (typically the broker) observes connections.

use std::{any, borrow::Cow};

use crate::{connection::Connection, message::MultiplexerMessage};

/// Receives connection lifecycle events and decoded messages.
///
/// A single listener is shared by every connection of a server, so callbacks run concurrently from many tasks
/// and must be cheap. Do not block inside a callback; hand long work off to another task.
///
/// For a given connection, events are delivered in order: [`channel_open`](ProtocolListener::channel_open),
/// [`channel_connected`](ProtocolListener::channel_connected), any number of
/// [`message_received`](ProtocolListener::message_received), then at most one
/// [`channel_disconnected`](ProtocolListener::channel_disconnected). No message is delivered after the
/// disconnect.
///
/// A panic in a callback closes the connection it was invoked for and nothing else.
///
/// # Example
///
/// ```
/// use multiplexer::{Connection, MultiplexerMessage, ProtocolListener};
///
/// struct Echo;
///
/// impl ProtocolListener for Echo {
///     fn message_received(&self, message: MultiplexerMessage, connection: &Connection) {
///         let _ = connection.try_send(message);
///     }
///
///     fn channel_open(&self, _connection: &Connection) {}
///
///     fn channel_connected(&self, _connection: &Connection) {}
///
///     fn channel_disconnected(&self, _connection: &Connection) {}
/// }
/// ```
pub trait ProtocolListener: Send + Sync + 'static {
    /// Name of the listener, used to identify it in fault logs.
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(any::type_name::<Self>())
    }

    /// Called for every decoded message, heartbeats included.
    fn message_received(&self, message: MultiplexerMessage, connection: &Connection);

    /// Called once the connection is registered with the transport, before any byte is exchanged.
    fn channel_open(&self, connection: &Connection);

    /// Called once the connection is established and ready to carry messages.
    fn channel_connected(&self, connection: &Connection);

    /// Called once when the connection has closed, whatever the reason.
    fn channel_disconnected(&self, connection: &Connection);
}
