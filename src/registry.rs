//! Registry of live connections, indexed by peer type and peer id.
//!
//! The [`ConnectionRegistry`] answers the two routing questions of the multiplexer: "give me any peer of type
//! X" (round-robin over every connection identified with that type) and "give me the connection of peer N"
//! (the most recent connection identified with that id).
//!
//! Connections enter the registry twice. [`ConnectionRegistry::track_opened`] adds a freshly accepted
//! connection to the set of all connections. [`ConnectionRegistry::identify`] adds it to the type and id
//! indexes once the welcome handshake has revealed who is on the other end. Either call attaches a close hook,
//! so a connection leaves every index by itself when its transport closes. The hook only holds a weak handle to
//! the registry and never keeps it alive.
//!
//! All indexes live behind one lock, so no operation ever observes a connection that is half inserted or half
//! removed.

#[cfg(debug_assertions)]
use std::cell::RefCell;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::{Mutex, MutexGuard};
use slab::Slab;
use tracing::{debug, trace};

use crate::{
    connection::{Connection, ConnectionId},
    error::RegistryError,
    PeerId, PeerType,
};

/// A thread-safe index of live connections.
///
/// Cloning the registry yields another handle to the same tables.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    tables: Arc<Mutex<Tables>>,
}

impl ConnectionRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        ConnectionRegistry::default()
    }

    /// Adds a newly opened connection to the set of all connections.
    ///
    /// The connection removes itself from the registry when it closes.
    pub fn track_opened(&self, connection: &Connection) {
        let newly_seen = {
            let mut tables = lock_tables(&self.tables);
            let identified = tables.identities.contains_key(&connection.id());
            let inserted = tables
                .all
                .insert(connection.id(), connection.clone())
                .is_none();
            inserted && !identified
        };

        if newly_seen {
            self.attach_remover(connection);
        }
    }

    /// Indexes a connection under the peer id and peer type learned from its welcome message.
    ///
    /// If another connection was registered for `peer_id`, it is removed from the type and id indexes and
    /// returned. The registry never closes connections; closing the returned one is up to the caller.
    ///
    /// Identifying the same connection again moves it to the new id and type.
    pub fn identify(
        &self,
        connection: &Connection,
        peer_id: PeerId,
        peer_type: PeerType,
    ) -> Option<Connection> {
        let id = connection.id();
        let (previous, newly_seen) = {
            let mut tables = lock_tables(&self.tables);
            let newly_seen = !tables.all.contains_key(&id) && !tables.identities.contains_key(&id);

            tables.detach_identity(id);
            let stale = tables
                .by_peer_id
                .get(&peer_id)
                .map(Connection::id)
                .filter(|stale| *stale != id);
            let previous = stale.and_then(|stale| tables.detach_identity(stale));

            let slot = tables
                .by_type
                .entry(peer_type)
                .or_default()
                .push_back(connection.clone());
            tables.identities.insert(
                id,
                Identity {
                    peer_id,
                    peer_type,
                    slot,
                },
            );
            tables.by_peer_id.insert(peer_id, connection.clone());

            (previous, newly_seen)
        };

        if newly_seen {
            self.attach_remover(connection);
        }
        if !connection.is_open() {
            // Closed while being identified, after its close hook already ran.
            self.remove(connection);
        }
        if let Some(previous) = &previous {
            debug!(
                %peer_id,
                peer_type,
                connection = %connection,
                previous = %previous,
                "peer reconnected, superseding previous connection"
            );
        }

        previous
    }

    /// Returns the peer type a connection was identified with.
    pub fn type_of(&self, connection: &Connection) -> Option<PeerType> {
        lock_tables(&self.tables)
            .identities
            .get(&connection.id())
            .map(|identity| identity.peer_type)
    }

    /// Removes a connection from every index.
    ///
    /// Returns `true` if the connection was found in any of them. Removing twice is harmless.
    pub fn remove(&self, connection: &Connection) -> bool {
        lock_tables(&self.tables).remove(connection.id())
    }

    /// Picks a connection of the given peer type, in round-robin order.
    ///
    /// Closed connections met along the way are dropped from the indexes.
    pub fn pick_any(&self, peer_type: PeerType) -> Result<Connection, RegistryError> {
        let mut tables = lock_tables(&self.tables);
        loop {
            let front = tables
                .by_type
                .get(&peer_type)
                .and_then(RotationList::front)
                .map(|connection| (connection.id(), connection.is_open()));

            match front {
                None => return Err(RegistryError::NoPeerForType(peer_type)),
                Some((_, true)) => {
                    return tables
                        .by_type
                        .get_mut(&peer_type)
                        .and_then(RotationList::rotate)
                        .ok_or(RegistryError::NoPeerForType(peer_type));
                }
                Some((closed, false)) => {
                    trace!(connection = %closed, peer_type, "evicting closed connection");
                    tables.detach_identity(closed);
                }
            }
        }
    }

    /// Returns every connection identified with the given peer type, in rotation order.
    ///
    /// The returned [`PeerGroup`] holds the registry lock until it is dropped. Do not call other registry
    /// methods, close connections or `.await` while holding it.
    pub fn pick_all(&self, peer_type: PeerType) -> Result<PeerGroup<'_>, RegistryError> {
        let tables = lock_tables(&self.tables);
        if tables
            .by_type
            .get(&peer_type)
            .map_or(true, RotationList::is_empty)
        {
            return Err(RegistryError::NoPeerForType(peer_type));
        }
        Ok(PeerGroup::new(tables, peer_type))
    }

    /// Returns the connection most recently identified with `peer_id`.
    pub fn by_peer_id(&self, peer_id: PeerId) -> Result<Connection, RegistryError> {
        lock_tables(&self.tables)
            .by_peer_id
            .get(&peer_id)
            .cloned()
            .ok_or(RegistryError::NoPeerForId(peer_id))
    }

    /// Returns a snapshot of every tracked connection that is still open.
    pub fn all_open_connections(&self) -> Vec<Connection> {
        lock_tables(&self.tables)
            .all
            .values()
            .filter(|connection| connection.is_open())
            .cloned()
            .collect()
    }

    /// Closes every tracked connection, returning how many were closed by this call.
    pub fn close_all(&self) -> usize {
        let connections: Vec<_> = lock_tables(&self.tables).all.values().cloned().collect();
        connections
            .iter()
            .filter(|connection| connection.close())
            .count()
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        lock_tables(&self.tables).all.len()
    }

    /// Returns `true` if no connection is tracked.
    pub fn is_empty(&self) -> bool {
        lock_tables(&self.tables).all.is_empty()
    }

    /// Number of connections identified with the given peer type, closed ones not yet evicted included.
    pub fn peer_count(&self, peer_type: PeerType) -> usize {
        lock_tables(&self.tables)
            .by_type
            .get(&peer_type)
            .map_or(0, RotationList::len)
    }

    fn attach_remover(&self, connection: &Connection) {
        let tables: Weak<Mutex<Tables>> = Arc::downgrade(&self.tables);
        connection.on_close(move |connection| {
            if let Some(tables) = tables.upgrade() {
                let removed = lock_tables(&tables).remove(connection.id());
                trace!(%connection, removed, "closed connection left the registry");
            }
        });
    }
}

#[cfg(debug_assertions)]
thread_local! {
    /// Registries whose tables are locked by a live [`PeerGroup`] on this thread.
    static HELD_GROUPS: RefCell<Vec<usize>> = RefCell::new(Vec::new());
}

#[cfg(debug_assertions)]
fn table_key(tables: &Mutex<Tables>) -> usize {
    tables as *const Mutex<Tables> as usize
}

/// Locks the tables, panicking in debug builds instead of deadlocking when the current thread holds a
/// [`PeerGroup`] of the same registry.
fn lock_tables(tables: &Mutex<Tables>) -> MutexGuard<'_, Tables> {
    #[cfg(debug_assertions)]
    HELD_GROUPS.with(|held| {
        assert!(
            !held.borrow().contains(&table_key(tables)),
            "connection registry used while a PeerGroup of it is held on this thread"
        );
    });
    tables.lock()
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ConnectionRegistry");
        match self.tables.try_lock() {
            Some(tables) => d
                .field("connections", &tables.all.len())
                .field("identified", &tables.identities.len())
                .field("peer_types", &tables.by_type.len())
                .finish(),
            None => d.finish_non_exhaustive(),
        }
    }
}

/// The connections of one peer type, borrowed from a locked registry.
///
/// Returned by [`ConnectionRegistry::pick_all`]. The registry stays locked while this value is alive.
///
/// The lock is not reentrant. Closing a tracked connection runs its close hook, which removes it from the
/// registry, so closing one while a group is held deadlocks, as does calling any other method of the same
/// registry. Debug builds panic instead. Use [`PeerGroup::to_vec`] and drop the group first.
pub struct PeerGroup<'a> {
    tables: MutexGuard<'a, Tables>,
    peer_type: PeerType,
}

impl<'a> PeerGroup<'a> {
    fn new(tables: MutexGuard<'a, Tables>, peer_type: PeerType) -> Self {
        #[cfg(debug_assertions)]
        HELD_GROUPS.with(|held| held.borrow_mut().push(table_key(MutexGuard::mutex(&tables))));
        PeerGroup { tables, peer_type }
    }
}

impl Drop for PeerGroup<'_> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let key = table_key(MutexGuard::mutex(&self.tables));
            let _ = HELD_GROUPS.try_with(|held| {
                let mut held = held.borrow_mut();
                if let Some(pos) = held.iter().rposition(|k| *k == key) {
                    held.swap_remove(pos);
                }
            });
        }
    }
}

impl PeerGroup<'_> {
    /// The peer type of this group.
    pub fn peer_type(&self) -> PeerType {
        self.peer_type
    }

    /// Number of connections in the group.
    pub fn len(&self) -> usize {
        self.list().map_or(0, RotationList::len)
    }

    /// Returns `true` if the group has no connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the connections in rotation order.
    pub fn iter(&self) -> PeerIter<'_> {
        PeerIter {
            list: self.list(),
            cursor: self.list().and_then(|list| list.head),
        }
    }

    /// Clones the connections into a vector, to use them after releasing the lock.
    pub fn to_vec(&self) -> Vec<Connection> {
        self.iter().cloned().collect()
    }

    fn list(&self) -> Option<&RotationList> {
        self.tables.by_type.get(&self.peer_type)
    }
}

impl fmt::Debug for PeerGroup<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerGroup")
            .field("peer_type", &self.peer_type)
            .field("connections", &self.iter().collect::<Vec<_>>())
            .finish()
    }
}

impl<'g> IntoIterator for &'g PeerGroup<'_> {
    type Item = &'g Connection;
    type IntoIter = PeerIter<'g>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the connections of a [`PeerGroup`].
#[derive(Clone, Debug)]
pub struct PeerIter<'a> {
    list: Option<&'a RotationList>,
    cursor: Option<usize>,
}

impl<'a> Iterator for PeerIter<'a> {
    type Item = &'a Connection;

    fn next(&mut self) -> Option<Self::Item> {
        let node = &self.list?.nodes[self.cursor?];
        self.cursor = node.next;
        Some(&node.connection)
    }
}

#[derive(Default)]
struct Tables {
    all: HashMap<ConnectionId, Connection>,
    by_type: HashMap<PeerType, RotationList>,
    by_peer_id: HashMap<PeerId, Connection>,
    identities: HashMap<ConnectionId, Identity>,
}

#[derive(Clone, Copy, Debug)]
struct Identity {
    peer_id: PeerId,
    peer_type: PeerType,
    slot: usize,
}

impl Tables {
    /// Removes a connection from the type and id indexes, returning it if it was there.
    fn detach_identity(&mut self, id: ConnectionId) -> Option<Connection> {
        let identity = self.identities.remove(&id)?;
        if self
            .by_peer_id
            .get(&identity.peer_id)
            .is_some_and(|connection| connection.id() == id)
        {
            self.by_peer_id.remove(&identity.peer_id);
        }

        let list = self.by_type.get_mut(&identity.peer_type)?;
        let connection = list.remove(identity.slot);
        if list.is_empty() {
            self.by_type.remove(&identity.peer_type);
        }
        connection
    }

    fn remove(&mut self, id: ConnectionId) -> bool {
        let tracked = self.all.remove(&id).is_some();
        let identified = self.detach_identity(id).is_some();
        tracked || identified
    }
}

struct Node {
    connection: Connection,
    prev: Option<usize>,
    next: Option<usize>,
}

/// A doubly linked list of connections stored in a slab.
///
/// Slots stay valid while a node moves around the list, so the identity table can point straight at a node.
#[derive(Default)]
struct RotationList {
    nodes: Slab<Node>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl RotationList {
    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn front(&self) -> Option<&Connection> {
        self.head.map(|head| &self.nodes[head].connection)
    }

    fn push_back(&mut self, connection: Connection) -> usize {
        let slot = self.nodes.insert(Node {
            connection,
            prev: None,
            next: None,
        });
        self.link_back(slot);
        slot
    }

    fn remove(&mut self, slot: usize) -> Option<Connection> {
        if !self.nodes.contains(slot) {
            return None;
        }
        self.unlink(slot);
        Some(self.nodes.remove(slot).connection)
    }

    /// Moves the front connection to the back and returns it.
    fn rotate(&mut self) -> Option<Connection> {
        let head = self.head?;
        if self.tail != Some(head) {
            self.unlink(head);
            self.link_back(head);
        }
        Some(self.nodes[head].connection.clone())
    }

    fn link_back(&mut self, slot: usize) {
        self.nodes[slot].next = None;
        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.nodes[slot].prev = self.tail;
        self.tail = Some(slot);
    }

    fn unlink(&mut self, slot: usize) {
        let Node { prev, next, .. } = self.nodes[slot];
        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[slot].prev = None;
        self.nodes[slot].next = None;
    }
}

impl fmt::Debug for RotationList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                (PeerIter {
                    list: Some(self),
                    cursor: self.head,
                })
                .map(Connection::id),
            )
            .finish()
    }
}
