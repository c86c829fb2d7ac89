// src/core/protocol/frame.rs

//! Implements the framed message structure and the corresponding `Encoder`
//! and `Decoder` for network communication.
//!
//! Every message on the game channel is a fixed 16-byte header followed by
//! an opaque payload. Header fields, all little-endian u32:
//! `type, source_uid, stream_id, size`.

use crate::core::RelayError;
use crate::core::protocol::MessageType;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 16;

/// Hard cap on the payload length. Frames announcing more than this are
/// rejected as malformed before any buffering happens, so a hostile header
/// cannot make the decoder allocate without bound.
pub const MAX_PAYLOAD_LEN: usize = 8 * 1024 * 1024;

/// A single decoded frame: raw header fields plus the opaque payload.
///
/// `ty` stays a raw u32 so that unknown message types survive decoding and
/// can be logged and dropped by the dispatcher instead of killing the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ty: u32,
    pub source_uid: u32,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(ty: MessageType, source_uid: u32, stream_id: u32, payload: Bytes) -> Self {
        Self {
            ty: ty.into(),
            source_uid,
            stream_id,
            payload,
        }
    }

    /// The decoded message type, if the raw value is one the core knows.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u32(self.ty)
    }

    /// Queueing priority of this frame. High-frequency state updates are
    /// droppable under backpressure; everything else is control traffic and
    /// must never be discarded.
    pub fn class(&self) -> FrameClass {
        match self.message_type() {
            Some(MessageType::StreamData) | Some(MessageType::VehicleData) => FrameClass::Bulk,
            _ => FrameClass::Control,
        }
    }

    /// A convenience method to encode a frame into a `Vec<u8>`, used by
    /// tests and the handshake path where a complete byte vector is needed.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, RelayError> {
        let mut buf = BytesMut::new();
        FrameCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }
}

/// Backpressure class of an outgoing frame. See [`Frame::class`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Stream and vehicle data; oldest frames of this class are discarded
    /// when a receiver's queue overflows.
    Bulk,
    /// Everything else; never dropped.
    Control,
}

/// A `tokio_util::codec` implementation for encoding and decoding [`Frame`]s.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = RelayError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD_LEN {
            return Err(RelayError::FrameTooLarge(item.payload.len()));
        }
        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_u32_le(item.ty);
        dst.put_u32_le(item.source_uid);
        dst.put_u32_le(item.stream_id);
        dst.put_u32_le(item.payload.len() as u32);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RelayError;

    /// Decodes a [`Frame`] from the buffer.
    ///
    /// Returns `Ok(None)` while the buffer does not yet contain a full
    /// frame, letting the `Framed` stream wait for more data. An announced
    /// payload size above the cap is an immediate error.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &src[..HEADER_LEN];
        let ty = header.get_u32_le();
        let source_uid = header.get_u32_le();
        let stream_id = header.get_u32_le();
        let size = header.get_u32_le() as usize;

        if size > MAX_PAYLOAD_LEN {
            return Err(RelayError::FrameTooLarge(size));
        }
        if src.len() < HEADER_LEN + size {
            // Reserve in one step so repeated small reads don't thrash.
            src.reserve(HEADER_LEN + size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(size).freeze();
        Ok(Some(Frame {
            ty,
            source_uid,
            stream_id,
            payload,
        }))
    }

    /// Called on EOF: leftover bytes mean the peer hung up mid-frame.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(RelayError::IncompleteFrame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_all_fields() {
        let frame = Frame::new(
            MessageType::StreamData,
            7,
            3,
            Bytes::from_static(b"payload bytes"),
        );
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_header_yields_none() {
        let mut buf = BytesMut::from(&[1u8, 2, 3][..]);
        assert!(FrameCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_announcement_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(MessageType::StreamData.into());
        buf.put_u32_le(1);
        buf.put_u32_le(0);
        buf.put_u32_le((MAX_PAYLOAD_LEN + 1) as u32);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(RelayError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn eof_mid_frame_is_an_error() {
        let frame = Frame::new(MessageType::Chat, 1, 0, Bytes::from_static(b"hello"));
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf).unwrap();
        buf.truncate(buf.len() - 2);
        assert!(matches!(
            FrameCodec.decode_eof(&mut buf),
            Err(RelayError::IncompleteFrame)
        ));
    }
}
