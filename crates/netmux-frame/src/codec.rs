use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Packet header: channel (2) + sequence (2) + payload length (4) = 8 bytes.
///
/// Wire format of one packet (the body of an outer frame):
/// ```text
/// ┌───────────┬───────────┬───────────┬──────────────────┐
/// │ Channel   │ Sequence  │ Length    │ Payload          │
/// │ (2B BE)   │ (2B BE)   │ (4B BE)   │ (Length bytes)   │
/// └───────────┴───────────┴───────────┴──────────────────┘
/// ```
/// The sequence restarts at 1 after every flush and doubles as the
/// reassembly batch index on the receiving side.
pub const PACKET_HEADER_SIZE: usize = 8;

/// The trailing part of the packet header (sequence + length) that the
/// valve forwards to the input channel together with the payload.
pub const SUB_HEADER_SIZE: usize = 6;

/// A decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub channel: u16,
    pub sequence: u16,
    pub payload_len: u32,
}

/// Encode a packet header into `dst`.
pub fn encode_packet_header(header: PacketHeader, dst: &mut BytesMut) {
    dst.reserve(PACKET_HEADER_SIZE);
    dst.put_u16(header.channel);
    dst.put_u16(header.sequence);
    dst.put_u32(header.payload_len);
}

/// Decode a packet header from the start of `src`.
///
/// Returns `None` if fewer than [`PACKET_HEADER_SIZE`] bytes are present.
pub fn decode_packet_header(src: &[u8]) -> Option<PacketHeader> {
    if src.len() < PACKET_HEADER_SIZE {
        return None;
    }
    Some(PacketHeader {
        channel: u16::from_be_bytes([src[0], src[1]]),
        sequence: u16::from_be_bytes([src[2], src[3]]),
        payload_len: u32::from_be_bytes([src[4], src[5], src[6], src[7]]),
    })
}

/// Decode one length-prefixed block (`[u32 length][body]`) from a staging
/// buffer, consuming it on success.
///
/// Returns `Ok(None)` while the buffer does not yet hold a complete
/// block. Blocks larger than `max_block` are rejected so a corrupt
/// length prefix cannot pin the staging buffer.
pub fn decode_block(src: &mut BytesMut, max_block: usize) -> Result<Option<Bytes>> {
    if src.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if length > max_block {
        return Err(FrameError::BufferOverflow {
            size: length,
            free: max_block,
        });
    }

    if src.len() < 4 + length {
        return Ok(None);
    }

    src.advance(4);
    Ok(Some(src.split_to(length).freeze()))
}
