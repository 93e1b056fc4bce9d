//! Handles to live peer connections.
//!
//! A [`Connection`] is a cheap, clonable handle to one duplex link with a peer. The transport task owning the
//! socket holds the receiving half of the connection's outbound queue; everyone else writes through
//! [`Connection::send`] or [`Connection::try_send`] and observes its lifecycle through [`Connection::is_open`],
//! [`Connection::closed`] and close hooks.
//!
//! Closing is idempotent. The first call to [`Connection::close`] flips the connection to closed, wakes every
//! [`Connection::closed`] future and runs every registered close hook exactly once.

use std::{
    fmt,
    hash::{Hash, Hasher},
    mem,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{error::ConnectionError, message::MultiplexerMessage};

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique identifier of a [`Connection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generates the next identifier.
    fn generate() -> Self {
        ConnectionId(CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw sequence number.
    pub fn sequence_id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receiving half of a connection's outbound queue, owned by the transport.
pub type OutboundReceiver = mpsc::Receiver<MultiplexerMessage>;

type CloseHook = Box<dyn FnOnce(&Connection) + Send + 'static>;

struct Lifecycle {
    open: bool,
    hooks: Vec<CloseHook>,
}

struct ConnectionInner {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    lifecycle: Mutex<Lifecycle>,
    closed: CancellationToken,
    outbound: mpsc::Sender<MultiplexerMessage>,
}

/// A handle to a duplex link with a peer.
///
/// Handles compare and hash by [`ConnectionId`].
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Creates an open connection with an outbound queue of `outbound_capacity` messages.
    ///
    /// The returned receiver must be drained by whatever writes to the underlying socket.
    ///
    /// # Panics
    ///
    /// Panics if `outbound_capacity` is 0.
    pub fn new(peer_addr: Option<SocketAddr>, outbound_capacity: usize) -> (Self, OutboundReceiver) {
        let (tx, rx) = mpsc::channel(outbound_capacity);
        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::generate(),
                peer_addr,
                lifecycle: Mutex::new(Lifecycle {
                    open: true,
                    hooks: Vec::new(),
                }),
                closed: CancellationToken::new(),
                outbound: tx,
            }),
        };
        (connection, rx)
    }

    /// Identifier of the connection.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Address of the remote end, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Returns `true` until the connection is closed.
    pub fn is_open(&self) -> bool {
        !self.inner.closed.is_cancelled()
    }

    /// Completes once the connection is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Closes the connection.
    ///
    /// Only the first call has an effect: it marks the connection closed, wakes [`Connection::closed`] and runs
    /// the close hooks on the calling thread, outside of any internal lock. Returns `true` for that first call.
    pub fn close(&self) -> bool {
        let hooks = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if !lifecycle.open {
                return false;
            }
            lifecycle.open = false;
            self.inner.closed.cancel();
            mem::take(&mut lifecycle.hooks)
        };

        trace!(connection = %self, hooks = hooks.len(), "connection closed");
        for hook in hooks {
            hook(self);
        }
        true
    }

    /// Registers a hook to run once when the connection closes.
    ///
    /// If the connection is already closed, the hook runs immediately.
    pub fn on_close<F>(&self, hook: F)
    where
        F: FnOnce(&Connection) + Send + 'static,
    {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.open {
                lifecycle.hooks.push(Box::new(hook));
                return;
            }
        }
        hook(self);
    }

    /// Queues a message for writing, waiting for room in the outbound queue.
    pub async fn send(&self, message: MultiplexerMessage) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed(self.id()));
        }
        self.inner
            .outbound
            .send(message)
            .await
            .map_err(|_| ConnectionError::Closed(self.id()))
    }

    /// Queues a message for writing without waiting.
    pub fn try_send(&self, message: MultiplexerMessage) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed(self.id()));
        }
        self.inner.outbound.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ConnectionError::Full(self.id()),
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed(self.id()),
        })
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.peer_addr {
            Some(addr) => write!(f, "{} ({addr})", self.inner.id),
            None => write!(f, "{}", self.inner.id),
        }
    }
}
