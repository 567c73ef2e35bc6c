// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The frame layout tuple buffers use when they cross the network: a fixed
//! header followed by the raw payload. Transport is out of scope; adapters
//! bring their own sockets and use this codec at both ends.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::buffer::TupleBuffer;
use crate::error::{StreamError, StreamResult};
use streaming_config::{OriginId, SequenceNumber, Timestamp};

pub const WIRE_MAGIC: u32 = 0x5354524D;

/// Header prepended to every frame. All integers little-endian.
pub const WIRE_HEADER_SIZE: usize = 48;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    ClientAnnouncement = 1,
    ServerReady = 2,
    DataBuffer = 3,
    EventBuffer = 4,
    EndOfStream = 5,
    Error = 6,
}

impl TryFrom<u32> for MessageType {
    type Error = StreamError;

    fn try_from(value: u32) -> StreamResult<Self> {
        match value {
            1 => Ok(MessageType::ClientAnnouncement),
            2 => Ok(MessageType::ServerReady),
            3 => Ok(MessageType::DataBuffer),
            4 => Ok(MessageType::EventBuffer),
            5 => Ok(MessageType::EndOfStream),
            6 => Ok(MessageType::Error),
            other => Err(StreamError::Protocol(format!(
                "unknown message type {other}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireHeader {
    pub message_type: MessageType,
    pub origin: OriginId,
    pub sequence: SequenceNumber,
    pub watermark: Timestamp,
    pub creation_timestamp: Timestamp,
    pub tuple_count: u32,
    pub payload_size: u32,
}

impl WireHeader {
    /// The header a data buffer carries on the wire.
    pub fn for_buffer(buffer: &TupleBuffer) -> Self {
        let metadata = buffer.metadata();
        let message_type = if metadata.end_of_stream {
            MessageType::EndOfStream
        } else {
            MessageType::DataBuffer
        };
        Self {
            message_type,
            origin: metadata.origin_id,
            sequence: metadata.sequence_number,
            watermark: metadata.watermark,
            creation_timestamp: metadata.creation_timestamp,
            tuple_count: metadata.tuple_count,
            payload_size: metadata.tuple_count * metadata.record_size,
        }
    }
}

pub fn encode_frame(header: &WireHeader, payload: &[u8]) -> StreamResult<BytesMut> {
    if payload.len() != header.payload_size as usize {
        return Err(StreamError::Protocol(format!(
            "payload is {} bytes, header says {}",
            payload.len(),
            header.payload_size
        )));
    }
    let mut frame = BytesMut::with_capacity(WIRE_HEADER_SIZE + payload.len());
    frame.put_u32_le(WIRE_MAGIC);
    frame.put_u32_le(header.message_type as u32);
    frame.put_u64_le(header.origin);
    frame.put_u64_le(header.sequence);
    frame.put_u64_le(header.watermark);
    frame.put_u64_le(header.creation_timestamp);
    frame.put_u32_le(header.tuple_count);
    frame.put_u32_le(header.payload_size);
    frame.put_slice(payload);
    Ok(frame)
}

/// Decodes one frame, consuming it from `buf`. Fails on a short buffer, a bad
/// magic, an unknown message type, or a truncated payload.
pub fn decode_frame(buf: &mut impl Buf) -> StreamResult<(WireHeader, Bytes)> {
    if buf.remaining() < WIRE_HEADER_SIZE {
        return Err(StreamError::Protocol(format!(
            "frame header truncated: {} bytes",
            buf.remaining()
        )));
    }
    let magic = buf.get_u32_le();
    if magic != WIRE_MAGIC {
        return Err(StreamError::Protocol(format!(
            "bad frame magic {magic:#010x}"
        )));
    }
    let message_type = MessageType::try_from(buf.get_u32_le())?;
    let header = WireHeader {
        message_type,
        origin: buf.get_u64_le(),
        sequence: buf.get_u64_le(),
        watermark: buf.get_u64_le(),
        creation_timestamp: buf.get_u64_le(),
        tuple_count: buf.get_u32_le(),
        payload_size: buf.get_u32_le(),
    };
    if header.watermark > header.creation_timestamp {
        return Err(StreamError::Protocol(format!(
            "watermark {} ahead of creation timestamp {}",
            header.watermark, header.creation_timestamp
        )));
    }
    if buf.remaining() < header.payload_size as usize {
        return Err(StreamError::Protocol(format!(
            "payload truncated: {} of {} bytes",
            buf.remaining(),
            header.payload_size
        )));
    }
    let payload = buf.copy_to_bytes(header.payload_size as usize);
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(payload_size: u32) -> WireHeader {
        WireHeader {
            message_type: MessageType::DataBuffer,
            origin: 3,
            sequence: 17,
            watermark: 90,
            creation_timestamp: 95,
            tuple_count: payload_size / 24,
            payload_size,
        }
    }

    #[test]
    fn frames_round_trip() {
        let payload = vec![0xAB; 48];
        let frame = encode_frame(&header(48), &payload).unwrap();
        assert_eq!(frame.len(), WIRE_HEADER_SIZE + 48);

        let mut buf = frame.freeze();
        let (decoded, body) = decode_frame(&mut buf).unwrap();
        assert_eq!(decoded, header(48));
        assert_eq!(&body[..], &payload[..]);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut frame = encode_frame(&header(0), &[]).unwrap();
        frame[0] ^= 0xFF;
        let mut buf = frame.freeze();
        assert!(matches!(
            decode_frame(&mut buf),
            Err(StreamError::Protocol(_))
        ));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut frame = encode_frame(&header(0), &[]).unwrap();
        // Overwrite the message type with a bogus value.
        frame[4..8].copy_from_slice(&99u32.to_le_bytes());
        let mut buf = frame.freeze();
        assert!(matches!(
            decode_frame(&mut buf),
            Err(StreamError::Protocol(_))
        ));
    }

    #[test]
    fn non_monotone_watermark_is_rejected() {
        let mut bad = header(0);
        bad.watermark = 100;
        bad.creation_timestamp = 50;
        let frame = encode_frame(&bad, &[]).unwrap();
        let mut buf = frame.freeze();
        assert!(matches!(
            decode_frame(&mut buf),
            Err(StreamError::Protocol(_))
        ));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let payload = vec![1u8; 24];
        let frame = encode_frame(&header(24), &payload).unwrap();
        let mut buf = frame.freeze().slice(..WIRE_HEADER_SIZE + 10);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(StreamError::Protocol(_))
        ));
    }
}
