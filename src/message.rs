//! # BitTorrent Peer Wire Messages
//!
//! This module defines the message types and serialization for the peer
//! wire protocol. All post-handshake communication between peers uses
//! these messages.
//!
//! ## Message Structure
//!
//! Every message follows the same format:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length Prefix**: 4 bytes (big-endian u32), covering ID + payload
//! - **Message ID**: 1 byte
//! - **Payload**: Variable length (length - 1 bytes)
//!
//! ## Message Types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index (u32) |
//! | 5 | BITFIELD | raw bitfield bytes |
//! | 6 | REQUEST | index, begin, length (u32 each) |
//! | 7 | PIECE | index, begin, block data |
//! | 8 | CANCEL | index, begin, length (u32 each) |
//! | 9 | PORT | DHT listen port (u16) |
//!
//! A keep-alive is a bare zero length prefix with no ID or payload; it is
//! represented here with the reserved internal id 255.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

type MessageId = u8;
type MessagePayload = Vec<u8>;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
pub const MESSAGE_CANCEL: MessageId = 8;
pub const MESSAGE_PORT: MessageId = 9;
pub const MESSAGE_KEEPALIVE: MessageId = 255; // Special value for keep-alive (length 0)

/// Standard block size for piece requests (16 KiB).
pub const BLOCK_SIZE: u32 = 16384;

#[derive(Default, Debug)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: MessagePayload,
}

impl Message {
    /// Build a new message without a payload.
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a new message with a payload.
    pub fn new_with_payload(id: MessageId, payload: MessagePayload) -> Self {
        Message { id, payload }
    }

    /// Build a HAVE message announcing possession of a piece.
    #[allow(dead_code)]
    pub fn have(index: u32) -> Self {
        let mut payload = vec![];
        payload.write_u32::<BigEndian>(index).expect("vec write");
        Message::new_with_payload(MESSAGE_HAVE, payload)
    }

    /// Build a REQUEST message for a block within a piece.
    pub fn request(index: u32, begin: u32, length: u32) -> Self {
        let mut payload = vec![];
        payload.write_u32::<BigEndian>(index).expect("vec write");
        payload.write_u32::<BigEndian>(begin).expect("vec write");
        payload.write_u32::<BigEndian>(length).expect("vec write");
        Message::new_with_payload(MESSAGE_REQUEST, payload)
    }

    /// Serialize message with its length prefix.
    pub fn serialize(&self) -> Vec<u8> {
        // Keep-alive is a bare zero length prefix
        if self.id == MESSAGE_KEEPALIVE {
            return vec![0; 4];
        }

        let message_len = 1 + self.payload.len();
        let mut serialized: Vec<u8> = Vec::with_capacity(4 + message_len);
        serialized
            .write_u32::<BigEndian>(message_len as u32)
            .expect("vec write");
        serialized.push(self.id);
        serialized.extend_from_slice(&self.payload);
        serialized
    }
}

/// Deserialize a message body (everything after the length prefix).
pub fn deserialize_message(message_buf: &[u8]) -> Result<Message> {
    let (id, payload) = message_buf
        .split_first()
        .ok_or_else(|| anyhow!("empty message body"))?;
    Ok(Message::new_with_payload(*id, payload.to_vec()))
}

/// Extract the piece index from a HAVE payload.
pub fn parse_have(payload: &[u8]) -> Result<u32> {
    if payload.len() != 4 {
        return Err(anyhow!("have payload has invalid length {}", payload.len()));
    }
    let mut cursor = Cursor::new(payload);
    Ok(cursor.read_u32::<BigEndian>()?)
}

/// Extract index, begin offset and block data from a PIECE payload.
pub fn parse_piece(payload: &[u8]) -> Result<(u32, u32, &[u8])> {
    if payload.len() < 8 {
        return Err(anyhow!("piece payload too short: {} bytes", payload.len()));
    }
    let mut cursor = Cursor::new(&payload[..8]);
    let index = cursor.read_u32::<BigEndian>()?;
    let begin = cursor.read_u32::<BigEndian>()?;
    Ok((index, begin, &payload[8..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_have() {
        let message = Message::have(5);
        assert_eq!(
            message.serialize(),
            [0x00, 0x00, 0x00, 0x05, 0x04, 0x00, 0x00, 0x00, 0x05]
        );
    }

    #[test]
    fn serialize_keep_alive() {
        let message = Message::new(MESSAGE_KEEPALIVE);
        assert_eq!(message.serialize(), [0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn serialize_request() {
        let message = Message::request(3, 0, BLOCK_SIZE);
        assert_eq!(
            message.serialize(),
            [
                0x00, 0x00, 0x00, 0x0d, 0x06, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x00, 0x40, 0x00
            ]
        );
    }

    #[test]
    fn round_trip_body() {
        let message = Message::have(42);
        let serialized = message.serialize();
        let parsed = deserialize_message(&serialized[4..]).unwrap();
        assert_eq!(parsed.id, MESSAGE_HAVE);
        assert_eq!(parse_have(&parsed.payload).unwrap(), 42);
    }

    #[test]
    fn parse_piece_payload() {
        let mut payload = vec![];
        payload.write_u32::<BigEndian>(7).unwrap();
        payload.write_u32::<BigEndian>(16384).unwrap();
        payload.extend_from_slice(b"data");
        let (index, begin, data) = parse_piece(&payload).unwrap();
        assert_eq!(index, 7);
        assert_eq!(begin, 16384);
        assert_eq!(data, b"data");
    }

    #[test]
    fn parse_piece_rejects_short_payload() {
        assert!(parse_piece(&[0; 7]).is_err());
    }

    #[test]
    fn parse_have_rejects_bad_length() {
        assert!(parse_have(&[0; 3]).is_err());
        assert!(parse_have(&[0; 5]).is_err());
    }
}
