//! # BitTorrent Peer Information
//!
//! This module defines the peer address model and the construction of our
//! own peer identity.
//!
//! ## Peer Discovery
//!
//! Peers are discovered through tracker announces. Trackers return either a
//! compact binary list or a list of dictionaries; both decode into [`Peer`]
//! values addressed by `ip:port`.
//!
//! ## Compact Peer Format
//!
//! The compact format consists of 6-byte entries:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! with both fields in network byte order (big-endian).

use std::io::Cursor;
use std::time::Duration;

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};
use rand::Rng;

const PEER_SIZE: usize = 6;

/// The port we report to trackers.
pub const DEFAULT_PORT: u16 = 6881;

/// A remote peer in the swarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// IP address or host name of the peer
    pub ip: String,
    /// Port the peer listens on
    pub port: u16,
    /// Peer id, when the tracker reported one
    #[allow(dead_code)]
    pub id: Option<[u8; 20]>,
}

impl Peer {
    pub fn new(ip: String, port: u16) -> Peer {
        Peer { ip, port, id: None }
    }

    /// The `ip:port` form used for connecting, de-duplication and logging.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Our own identity as announced to trackers and peers.
#[derive(Debug, Clone)]
pub struct SelfPeer {
    /// Random 20-byte peer id, regenerated each run
    pub id: [u8; 20],
    /// Externally visible IP, empty when the probe fails
    pub ip: String,
    /// Port we claim to listen on
    pub port: u16,
}

impl SelfPeer {
    /// Builds our identity: a random peer id and the external IP.
    pub fn detect() -> SelfPeer {
        let mut id = [0u8; 20];
        let mut rng = rand::thread_rng();
        for byte in id.iter_mut() {
            *byte = rng.gen();
        }

        SelfPeer {
            id,
            ip: external_ip(),
            port: DEFAULT_PORT,
        }
    }

    /// The `ip:port` form, for filtering ourselves out of peer lists.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Asks an external service for our public IP.
///
/// Any failure yields an empty string, which trackers accept in announce
/// payloads (they fall back to the request's source address).
fn external_ip() -> String {
    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(_) => return String::new(),
    };

    match client.get("https://api.ipify.org/").send() {
        Ok(response) => response.text().unwrap_or_default(),
        Err(_) => String::new(),
    }
}

/// Parses a compact peer list into [`Peer`] values.
///
/// # Errors
///
/// Returns an error if the list length is not a multiple of 6 bytes.
pub fn parse_compact_peers(tracker_peers: &[u8]) -> Result<Vec<Peer>> {
    if tracker_peers.len() % PEER_SIZE != 0 {
        return Err(anyhow!("received invalid peers from tracker"));
    }

    let mut peers = Vec::with_capacity(tracker_peers.len() / PEER_SIZE);
    for record in tracker_peers.chunks_exact(PEER_SIZE) {
        let ip = format!("{}.{}.{}.{}", record[0], record[1], record[2], record[3]);
        let mut port_cursor = Cursor::new(&record[4..6]);
        let port = port_cursor.read_u16::<BigEndian>()?;
        peers.push(Peer::new(ip, port));
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_compact_list() {
        let data = [192, 168, 1, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80];
        let peers = parse_compact_peers(&data).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].ip, "192.168.1.1");
        assert_eq!(peers[0].port, 6881);
        assert_eq!(peers[1].addr(), "10.0.0.2:80");
    }

    #[test]
    fn parse_rejects_partial_record() {
        assert!(parse_compact_peers(&[1, 2, 3, 4, 5]).is_err());
    }

    #[test]
    fn parse_empty_list() {
        assert!(parse_compact_peers(&[]).unwrap().is_empty());
    }
}
