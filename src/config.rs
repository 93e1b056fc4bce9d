//! Per-connection configuration.

use std::time::Duration;

use bytes::{Buf, BufMut};

use crate::frame::MAX_FRAME_LENGTH;

/// Byte order of the integers in a frame header.
///
/// Both ends of a connection must agree on it before any byte is exchanged.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum ByteOrder {
    /// Most significant byte first.
    BigEndian,
    /// Least significant byte first.
    #[default]
    LittleEndian,
}

impl ByteOrder {
    pub(crate) fn get_i32(self, buf: &mut impl Buf) -> i32 {
        match self {
            ByteOrder::BigEndian => buf.get_i32(),
            ByteOrder::LittleEndian => buf.get_i32_le(),
        }
    }

    pub(crate) fn get_u32(self, buf: &mut impl Buf) -> u32 {
        match self {
            ByteOrder::BigEndian => buf.get_u32(),
            ByteOrder::LittleEndian => buf.get_u32_le(),
        }
    }

    pub(crate) fn put_i32(self, buf: &mut impl BufMut, n: i32) {
        match self {
            ByteOrder::BigEndian => buf.put_i32(n),
            ByteOrder::LittleEndian => buf.put_i32_le(n),
        }
    }

    pub(crate) fn put_u32(self, buf: &mut impl BufMut, n: u32) {
        match self {
            ByteOrder::BigEndian => buf.put_u32(n),
            ByteOrder::LittleEndian => buf.put_u32_le(n),
        }
    }
}

/// Configuration applied to every connection created by a [`Server`](crate::transport::Server)
/// or by [`connect`](crate::transport::connect).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    byte_order: ByteOrder,
    max_frame_length: usize,
    outbound_capacity: usize,
    nodelay: bool,
    close_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::LittleEndian,
            max_frame_length: MAX_FRAME_LENGTH,
            outbound_capacity: 1024,
            nodelay: true,
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    /// Sets the byte order of frame headers.
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Sets the largest frame payload accepted or produced, in bytes.
    ///
    /// Values above [`MAX_FRAME_LENGTH`] are capped to it.
    pub fn with_max_frame_length(mut self, bytes: usize) -> Self {
        self.max_frame_length = bytes.min(MAX_FRAME_LENGTH);
        self
    }

    /// Sets how many outbound messages may wait for the socket before senders are pushed back.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        assert_ne!(capacity, 0, "outbound capacity must be at least 1");
        self.outbound_capacity = capacity;
        self
    }

    /// Sets `TCP_NODELAY` on sockets.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Sets how long a closed connection may spend flushing queued messages and shutting its stream down.
    ///
    /// When the peer stops reading, whatever is still unsent after this delay is dropped.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Byte order of frame headers.
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Largest frame payload accepted or produced, in bytes.
    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Capacity of each connection's outbound queue.
    pub fn outbound_capacity(&self) -> usize {
        self.outbound_capacity
    }

    /// Whether `TCP_NODELAY` is set on sockets.
    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    /// Time allowed for flushing and shutting down a closed connection.
    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }
}
