//! Structured messages exchanged between peers, and their serialization on top of [frames](crate::frame).
//!
//! A [`MultiplexerMessage`] is encoded as a named MessagePack map and carried as the payload of one frame.
//! [`MessageCodec`] stacks the two layers so a connection reads and writes whole messages.

use std::borrow::Cow;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    config::ConnectionConfig, constants::message_types, error::ProtocolError, frame::FrameCodec,
    MessageType, PeerId, PeerType,
};

/// Payloads larger than this are replaced by a placeholder in debug logs.
pub const DEBUG_MESSAGE_MAX_LENGTH: usize = 256;

/// A message routed by the multiplexer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MultiplexerMessage {
    /// Identity chosen by the sender, also used to correlate replies.
    pub id: u64,
    /// Peer id of the sender.
    pub from: PeerId,
    /// Peer id of the destination, `None` when the message is routed by type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    /// Kind of the message, see [`message_types`].
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Opaque payload.
    #[serde(default)]
    pub message: Bytes,
}

impl MultiplexerMessage {
    /// Creates a message of the given kind carrying `message`.
    pub fn new(kind: MessageType, message: impl Into<Bytes>) -> Self {
        MultiplexerMessage {
            kind,
            message: message.into(),
            ..Default::default()
        }
    }

    /// Creates an empty heartbeat message.
    pub fn heartbeat(from: PeerId) -> Self {
        MultiplexerMessage::new(message_types::HEARTBEAT, Bytes::new()).with_from(from)
    }

    /// Sets the message id.
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    /// Sets the sender's peer id.
    pub fn with_from(mut self, from: PeerId) -> Self {
        self.from = from;
        self
    }

    /// Sets the destination peer id.
    pub fn with_to(mut self, to: PeerId) -> Self {
        self.to = Some(to);
        self
    }

    /// Returns `true` for heartbeat messages.
    pub fn is_heartbeat(&self) -> bool {
        self.kind == message_types::HEARTBEAT
    }

    /// Destination peer id, treating `Some(0)` like `None`.
    pub fn destination(&self) -> Option<PeerId> {
        self.to.filter(|to| *to != 0)
    }

    /// Returns a copy suitable for logging.
    ///
    /// Payloads longer than [`DEBUG_MESSAGE_MAX_LENGTH`] are replaced with `<message length=N>`; shorter
    /// messages are borrowed unchanged.
    pub fn short_debug(&self) -> Cow<'_, MultiplexerMessage> {
        if self.message.len() <= DEBUG_MESSAGE_MAX_LENGTH {
            Cow::Borrowed(self)
        } else {
            Cow::Owned(MultiplexerMessage {
                message: Bytes::from(format!("<message length={}>", self.message.len())),
                ..self.clone()
            })
        }
    }

    /// Serializes the message into a frame payload.
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?.into())
    }

    /// Deserializes a message from a frame payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Payload of a [`CONNECTION_WELCOME`](message_types::CONNECTION_WELCOME) message, introducing a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WelcomeMessage {
    /// Type of the peer.
    #[serde(rename = "type")]
    pub peer_type: PeerType,
    /// Id of the peer.
    pub id: PeerId,
}

impl WelcomeMessage {
    /// Wraps this welcome into a [`MultiplexerMessage`] sent by the peer itself.
    pub fn into_message(self) -> Result<MultiplexerMessage, ProtocolError> {
        let payload = rmp_serde::to_vec_named(&self)?;
        Ok(MultiplexerMessage::new(message_types::CONNECTION_WELCOME, payload).with_from(self.id))
    }

    /// Reads a welcome from the payload of a [`MultiplexerMessage`].
    pub fn from_message(message: &MultiplexerMessage) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(&message.message)?)
    }
}

/// Codec turning a byte stream into [`MultiplexerMessage`]s and back.
#[derive(Clone, Debug, Default)]
pub struct MessageCodec {
    frames: FrameCodec,
}

impl MessageCodec {
    /// Creates a codec framing messages with the given frame codec.
    pub fn new(frames: FrameCodec) -> Self {
        MessageCodec { frames }
    }

    /// Creates a codec from a connection configuration.
    pub fn from_config(config: &ConnectionConfig) -> Self {
        MessageCodec::new(FrameCodec::from_config(config))
    }

    /// The underlying frame codec.
    pub fn frame_codec(&self) -> &FrameCodec {
        &self.frames
    }
}

impl Decoder for MessageCodec {
    type Item = MultiplexerMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode(src)? {
            Some(payload) => Ok(Some(MultiplexerMessage::from_bytes(&payload)?)),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode_eof(src)? {
            Some(payload) => Ok(Some(MultiplexerMessage::from_bytes(&payload)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<MultiplexerMessage> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: MultiplexerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&MultiplexerMessage>>::encode(self, &item, dst)
    }
}

impl<'a> Encoder<&'a MultiplexerMessage> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &'a MultiplexerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.to_bytes()?;
        self.frames.encode(payload, dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ByteOrder;

    use super::*;

    #[test]
    fn short_debug_borrows_small_messages() {
        let message = MultiplexerMessage::new(110, vec![7u8; DEBUG_MESSAGE_MAX_LENGTH]);
        assert!(matches!(message.short_debug(), Cow::Borrowed(_)));
    }

    #[test]
    fn short_debug_replaces_large_payloads() {
        let message = MultiplexerMessage::new(110, vec![7u8; DEBUG_MESSAGE_MAX_LENGTH + 1])
            .with_id(9)
            .with_from(3)
            .with_to(4);
        let short = message.short_debug();

        assert_eq!(&short.message[..], b"<message length=257>");
        assert_eq!((short.id, short.from, short.to, short.kind), (9, 3, Some(4), 110));
        // The message itself keeps its payload.
        assert_eq!(message.message.len(), DEBUG_MESSAGE_MAX_LENGTH + 1);
    }

    #[test]
    fn destination_treats_zero_as_unset() {
        let message = MultiplexerMessage::new(110, "x");
        assert_eq!(message.destination(), None);
        assert_eq!(message.clone().with_to(0).destination(), None);
        assert_eq!(message.with_to(5).destination(), Some(5));
    }

    #[test]
    fn heartbeats_are_recognised() {
        assert!(MultiplexerMessage::heartbeat(1).is_heartbeat());
        assert!(!MultiplexerMessage::new(message_types::PING, "").is_heartbeat());
    }

    #[test]
    fn message_codec_roundtrip() {
        let message = MultiplexerMessage::new(110, &b"binary \x00\xff payload"[..])
            .with_id(u64::MAX)
            .with_from(12)
            .with_to(34);

        let config = ConnectionConfig::default().with_byte_order(ByteOrder::BigEndian);
        let mut codec = MessageCodec::from_config(&config);
        let mut buf = BytesMut::new();
        codec.encode(&message, &mut buf).unwrap();
        codec.encode(MultiplexerMessage::heartbeat(12), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), message);
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            MultiplexerMessage::heartbeat(12)
        );
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let mut frames = FrameCodec::default();
        let mut buf = BytesMut::new();
        frames.encode(&b"\xc1 not msgpack"[..], &mut buf).unwrap();

        let mut codec = MessageCodec::default();
        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn welcome_roundtrip() {
        let welcome = WelcomeMessage {
            peer_type: 106,
            id: 0xDEAD_BEEF,
        };
        let message = welcome.into_message().unwrap();
        assert_eq!(message.kind, message_types::CONNECTION_WELCOME);
        assert_eq!(message.from, 0xDEAD_BEEF);
        assert_eq!(WelcomeMessage::from_message(&message).unwrap(), welcome);
    }
}
