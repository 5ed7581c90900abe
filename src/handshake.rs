//! # BitTorrent Handshake Protocol
//!
//! This module implements the initial handshake used to establish
//! communication between peers.
//!
//! ## Message Format
//!
//! The handshake is a fixed 68-byte message for the standard protocol:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - Length of the protocol string (19)
//! - **pstr**: Protocol identifier ("BitTorrent protocol")
//! - **reserved**: 8 bytes - All zeros, reserved for extensions
//! - **info_hash**: 20 bytes - SHA-1 of the torrent's info dictionary
//! - **peer_id**: 20 bytes - Unique identifier for the peer
//!
//! The info_hash ties the connection to one swarm: a peer answering with a
//! different hash is rejected before any message exchange.

use anyhow::{anyhow, Result};

/// The standard protocol identifier string.
pub const PROTOCOL_ID: &str = "BitTorrent protocol";

/// A handshake message, sent immediately after the TCP connect.
pub struct Handshake {
    /// Protocol identifier bytes ("BitTorrent protocol")
    pub pstr: Vec<u8>,
    /// 8 reserved bytes, all zeros
    pub reserved: [u8; 8],
    /// SHA-1 hash of the torrent's info dictionary
    pub info_hash: [u8; 20],
    /// Unique identifier for the sending peer
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Creates a handshake for the standard protocol.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake {
            pstr: PROTOCOL_ID.as_bytes().to_vec(),
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake for transmission.
    ///
    /// The result is always `49 + pstr.len()` bytes, 68 for the standard
    /// protocol string.
    pub fn serialize(&self) -> Vec<u8> {
        let mut serialized: Vec<u8> = Vec::with_capacity(49 + self.pstr.len());
        serialized.push(self.pstr.len() as u8);
        serialized.extend_from_slice(&self.pstr);
        serialized.extend_from_slice(&self.reserved);
        serialized.extend_from_slice(&self.info_hash);
        serialized.extend_from_slice(&self.peer_id);
        serialized
    }
}

/// Parses a received handshake.
///
/// `buf` holds everything after the initial pstrlen byte and must be
/// exactly `48 + pstrlen` bytes.
pub fn deserialize_handshake(buf: &[u8], pstrlen: usize) -> Result<Handshake> {
    if buf.len() != 48 + pstrlen {
        return Err(anyhow!(
            "handshake has invalid length {} for pstrlen {pstrlen}",
            buf.len()
        ));
    }

    let pstr = buf[..pstrlen].to_vec();
    let reserved: [u8; 8] = buf[pstrlen..pstrlen + 8].try_into().expect("8 bytes");
    let info_hash: [u8; 20] = buf[pstrlen + 8..pstrlen + 28].try_into().expect("20 bytes");
    let peer_id: [u8; 20] = buf[pstrlen + 28..].try_into().expect("20 bytes");

    Ok(Handshake {
        pstr,
        reserved,
        info_hash,
        peer_id,
    })
}
