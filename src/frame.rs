//! Length-prefixed, checksummed framing of the multiplexer wire protocol.
//!
//! Frame format: `[length:4][crc32:4][payload:length]`
//!
//! - **length**: payload size in bytes, a signed 32-bit integer in `0..=MAX_FRAME_LENGTH`
//! - **crc32**: standard CRC-32 of the payload (header excluded)
//! - **payload**: opaque bytes, usually a serialized [`MultiplexerMessage`](crate::message::MultiplexerMessage)
//!
//! Both header integers use the connection's configured [`ByteOrder`].
//!
//! [`FrameCodec`] decodes incrementally: each header field is consumed only once all of its bytes are buffered,
//! and the decoder remembers where it stopped, so a frame may arrive split across any number of reads.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::{
    config::{ByteOrder, ConnectionConfig},
    error::FrameError,
};

/// Header size: 4 (length) + 4 (crc32) bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest payload a frame may carry (128 MiB).
pub const MAX_FRAME_LENGTH: usize = 128 * 1024 * 1024;

/// Position of the decoder within the current frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeState {
    /// Waiting for the 4 byte length.
    ReadLength,
    /// Length known, waiting for the 4 byte checksum.
    ReadCrc32 {
        /// Payload length read from the header.
        length: usize,
    },
    /// Header known, waiting for `length` payload bytes.
    ReadMessage {
        /// Payload length read from the header.
        length: usize,
        /// Checksum read from the header.
        crc: u32,
    },
}

/// Frame encoder and incremental decoder.
///
/// A decoder holds per-connection state and must not be shared between connections.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    byte_order: ByteOrder,
    max_frame_length: usize,
    state: DecodeState,
}

impl FrameCodec {
    /// Creates a codec with the given header byte order and the default 128 MiB frame limit.
    pub fn new(byte_order: ByteOrder) -> Self {
        FrameCodec {
            byte_order,
            max_frame_length: MAX_FRAME_LENGTH,
            state: DecodeState::ReadLength,
        }
    }

    /// Creates a codec from a connection configuration.
    pub fn from_config(config: &ConnectionConfig) -> Self {
        FrameCodec {
            byte_order: config.byte_order(),
            max_frame_length: config.max_frame_length(),
            state: DecodeState::ReadLength,
        }
    }

    /// Current decoder state.
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Header byte order.
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Largest payload accepted or produced.
    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    fn encode_payload(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        if payload.len() > self.max_frame_length {
            return Err(FrameError::FrameTooLong {
                length: payload.len(),
                max: self.max_frame_length,
            });
        }

        dst.reserve(HEADER_SIZE + payload.len());
        // max_frame_length never exceeds MAX_FRAME_LENGTH, which fits in an i32
        self.byte_order.put_i32(dst, payload.len() as i32);
        self.byte_order.put_u32(dst, crc32fast::hash(payload));
        dst.extend_from_slice(payload);
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(ByteOrder::default())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(state = ?self.state, buffered = src.len(), "decoding frame");
            match self.state {
                DecodeState::ReadLength => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let length = self.byte_order.get_i32(src);
                    if length < 0 {
                        return Err(FrameError::NegativeLength(length));
                    }
                    let length = length as usize;
                    if length > self.max_frame_length {
                        return Err(FrameError::FrameTooLong {
                            length,
                            max: self.max_frame_length,
                        });
                    }
                    self.state = DecodeState::ReadCrc32 { length };
                }
                DecodeState::ReadCrc32 { length } => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let crc = self.byte_order.get_u32(src);
                    trace!(length, crc, "next frame");
                    self.state = DecodeState::ReadMessage { length, crc };
                }
                DecodeState::ReadMessage { length, crc } => {
                    if src.len() < length {
                        src.reserve(length - src.len());
                        return Ok(None);
                    }
                    let payload = src.split_to(length).freeze();
                    self.state = DecodeState::ReadLength;

                    let actual = crc32fast::hash(&payload);
                    if actual != crc {
                        return Err(FrameError::ChecksumMismatch {
                            length,
                            expected: crc,
                            actual,
                        });
                    }
                    return Ok(Some(payload));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        if self.state == DecodeState::ReadLength && src.is_empty() {
            // Stream ended on a frame boundary.
            return Ok(None);
        }

        warn!(
            state = ?self.state,
            readable_bytes = src.len(),
            "stream closed in the middle of a frame"
        );
        src.clear();
        self.state = DecodeState::ReadLength;
        Ok(None)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode_payload(&item, dst)
    }
}

impl<'a> Encoder<&'a [u8]> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &'a [u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode_payload(item, dst)
    }
}
