//! # UDP Tracker
//!
//! Announces over the UDP tracker protocol (BEP 15). All frames are
//! big-endian and every exchange is tagged with a random transaction id
//! that the response must echo.
//!
//! ## Exchange sequence
//!
//! 1. **Connect**: send the protocol magic and receive a connection id
//!    that authorizes the following requests.
//! 2. **Scrape**: fetch seeder/leecher counts for the info-hash.
//! 3. **Announce**: register our presence and receive the interval, swarm
//!    counts and a packed list of 6-byte peer records.
//!
//! A response with action 3 carries an ASCII error message from the
//! tracker. One socket is used per announce, with a 15-second deadline on
//! every send and receive; retrying is the caller's concern.

use std::io::Cursor;
use std::net::UdpSocket;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use url::Url;

use crate::metainfo::Metainfo;
use crate::peer::{self, SelfPeer};
use crate::tracker::{unix_now, Announce};

// Protocol magic sent with every connect request
const CONNECT_MAGIC: i64 = 0x41727101980;

// Actions
const ACTION_CONNECT: i32 = 0;
const ACTION_ANNOUNCE: i32 = 1;
const ACTION_SCRAPE: i32 = 2;
const ACTION_ERROR: i32 = 3;

// Announce events; only "started" is sent by this client
const EVENT_STARTED: i32 = 2;

const ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(15);

/// A tracker reached over UDP.
pub struct UdpTracker {
    announce_url: String,
    last_check: i64,
    next_check: i64,
    last_error: Option<String>,
}

impl UdpTracker {
    pub fn new(announce_url: String) -> UdpTracker {
        UdpTracker {
            announce_url,
            last_check: 0,
            next_check: 0,
            last_error: None,
        }
    }

    pub fn announce_url(&self) -> &str {
        &self.announce_url
    }

    pub fn last_check(&self) -> i64 {
        self.last_check
    }

    pub fn next_check(&self) -> i64 {
        self.next_check
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Runs the connect, scrape and announce exchanges on a fresh socket.
    pub fn announce(&mut self, metainfo: &Metainfo, me: &SelfPeer) -> Result<Announce> {
        let result = self.try_announce(metainfo, me);
        match &result {
            Ok(_) => self.last_error = None,
            Err(err) => self.last_error = Some(err.to_string()),
        }
        result
    }

    fn try_announce(&mut self, metainfo: &Metainfo, me: &SelfPeer) -> Result<Announce> {
        let url = Url::parse(&self.announce_url)
            .with_context(|| format!("parsing tracker url {}", self.announce_url))?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("tracker url {} has no host", self.announce_url))?;
        let port = url
            .port()
            .ok_or_else(|| anyhow!("tracker url {} has no port", self.announce_url))?;

        let socket = UdpSocket::bind("0.0.0.0:0").context("binding udp socket")?;
        socket
            .connect((host, port))
            .with_context(|| format!("resolving tracker {host}:{port}"))?;
        socket.set_read_timeout(Some(ROUND_TRIP_TIMEOUT))?;
        socket.set_write_timeout(Some(ROUND_TRIP_TIMEOUT))?;

        let connection_id = self.acquire_connection_id(&socket)?;
        // Scrape first for the swarm counts; the announce overwrites them
        // when it carries its own.
        let _ = self.scrape(&socket, connection_id, metainfo)?;
        self.announce_exchange(&socket, connection_id, metainfo, me)
    }

    /// Connect exchange: obtain the connection id for this conversation.
    fn acquire_connection_id(&self, socket: &UdpSocket) -> Result<i64> {
        let transaction_id: i32 = rand::random();

        let mut request = Vec::with_capacity(16);
        request.write_i64::<BigEndian>(CONNECT_MAGIC)?;
        request.write_i32::<BigEndian>(ACTION_CONNECT)?;
        request.write_i32::<BigEndian>(transaction_id)?;
        socket.send(&request).context("sending connect request")?;

        let payload = read_response(socket, ACTION_CONNECT, transaction_id)?;
        let mut cursor = Cursor::new(payload);
        let connection_id = cursor
            .read_i64::<BigEndian>()
            .context("connect response too short")?;
        Ok(connection_id)
    }

    /// Scrape exchange: seeder/leecher counts for this torrent.
    ///
    /// The response also carries a completed-downloads count, which is read
    /// and discarded.
    fn scrape(
        &mut self,
        socket: &UdpSocket,
        connection_id: i64,
        metainfo: &Metainfo,
    ) -> Result<(i32, i32)> {
        let transaction_id: i32 = rand::random();

        let mut request = Vec::with_capacity(36);
        request.write_i64::<BigEndian>(connection_id)?;
        request.write_i32::<BigEndian>(ACTION_SCRAPE)?;
        request.write_i32::<BigEndian>(transaction_id)?;
        request.extend_from_slice(&metainfo.info_hash);
        socket.send(&request).context("sending scrape request")?;

        let payload = read_response(socket, ACTION_SCRAPE, transaction_id)?;
        let mut cursor = Cursor::new(payload);
        let seeders = cursor.read_i32::<BigEndian>().context("scrape response too short")?;
        let _completed = cursor.read_i32::<BigEndian>().context("scrape response too short")?;
        let leechers = cursor.read_i32::<BigEndian>().context("scrape response too short")?;

        self.last_check = unix_now();
        debug!(
            "scrape of {}: {seeders} seeders, {leechers} leechers",
            self.announce_url
        );
        Ok((seeders, leechers))
    }

    /// Announce exchange: register our presence and collect peers.
    fn announce_exchange(
        &mut self,
        socket: &UdpSocket,
        connection_id: i64,
        metainfo: &Metainfo,
        me: &SelfPeer,
    ) -> Result<Announce> {
        let transaction_id: i32 = rand::random();

        let mut request = Vec::with_capacity(98);
        request.write_i64::<BigEndian>(connection_id)?;
        request.write_i32::<BigEndian>(ACTION_ANNOUNCE)?;
        request.write_i32::<BigEndian>(transaction_id)?;
        request.extend_from_slice(&metainfo.info_hash);
        request.extend_from_slice(&me.id);
        request.write_i64::<BigEndian>(0)?; // downloaded
        request.write_i64::<BigEndian>(metainfo.total_length as i64)?; // left
        request.write_i64::<BigEndian>(0)?; // uploaded
        request.write_i32::<BigEndian>(EVENT_STARTED)?;
        request.write_i32::<BigEndian>(0)?; // ip: tracker uses the source address
        request.write_i32::<BigEndian>(0)?; // key
        request.write_i32::<BigEndian>(-1)?; // num_want: tracker's default
        request.write_u16::<BigEndian>(me.port)?;
        socket.send(&request).context("sending announce request")?;

        let payload = read_response(socket, ACTION_ANNOUNCE, transaction_id)?;
        if payload.len() < 12 {
            return Err(anyhow!("announce response too short: {} bytes", payload.len()));
        }
        let mut cursor = Cursor::new(&payload[..12]);
        let interval = cursor.read_i32::<BigEndian>()?;
        let leechers = cursor.read_i32::<BigEndian>()?;
        let seeders = cursor.read_i32::<BigEndian>()?;

        let peers = peer::parse_compact_peers(&payload[12..])?;

        self.last_check = unix_now();
        self.next_check = self.last_check + interval as i64;

        Ok(Announce {
            peers,
            seeders: seeders as i64,
            leechers: leechers as i64,
            interval_secs: interval as i64,
        })
    }
}

/// Receives one datagram and validates its action and transaction id.
///
/// Returns the payload after the 8-byte action/transaction header. An
/// action-3 response is surfaced as the tracker's own error text.
fn read_response(socket: &UdpSocket, expected_action: i32, transaction_id: i32) -> Result<Vec<u8>> {
    let mut buf = [0u8; 1024];
    let received = socket.recv(&mut buf).context("reading tracker response")?;
    if received < 8 {
        return Err(anyhow!("tracker response too short: {received} bytes"));
    }

    let mut cursor = Cursor::new(&buf[..8]);
    let action = cursor.read_i32::<BigEndian>()?;
    let echoed = cursor.read_i32::<BigEndian>()?;

    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(&buf[8..received]).into_owned();
        return Err(anyhow!("tracker error: {message}"));
    }
    if echoed != transaction_id {
        return Err(anyhow!("transaction id mismatch"));
    }
    if action != expected_action {
        return Err(anyhow!("unexpected action: {action}"));
    }

    Ok(buf[8..received].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn test_metainfo() -> Metainfo {
        Metainfo {
            announce_list: vec![],
            name: "test".to_string(),
            url_list: vec![],
            comment: None,
            created_by: None,
            creation_date: None,
            files: vec![],
            piece_length: 16384,
            pieces: vec![[0; 20]],
            info_hash: [0xc4; 20],
            total_length: 1234,
            is_private: false,
        }
    }

    fn test_self_peer() -> SelfPeer {
        SelfPeer {
            id: [0x2d; 20],
            ip: String::new(),
            port: 6881,
        }
    }

    fn echoed_transaction(buf: &[u8], offset: usize) -> [u8; 4] {
        buf[offset..offset + 4].try_into().unwrap()
    }

    /// Speaks the tracker side of the connect, scrape and announce
    /// exchanges for a single client.
    fn loopback_udp_tracker(socket: UdpSocket) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut buf = [0u8; 2048];

            // Connect: echo the transaction id, grant a connection id
            let (received, from) = socket.recv_from(&mut buf).unwrap();
            assert_eq!(received, 16);
            assert_eq!(&buf[0..8], &0x41727101980i64.to_be_bytes());
            let mut response = Vec::new();
            response.extend_from_slice(&0i32.to_be_bytes());
            response.extend_from_slice(&echoed_transaction(&buf, 12));
            response.extend_from_slice(&0x1122_3344_5566_7788i64.to_be_bytes());
            socket.send_to(&response, from).unwrap();

            // Scrape: seeders 7, completed 3, leechers 2
            let (received, from) = socket.recv_from(&mut buf).unwrap();
            assert_eq!(received, 36);
            assert_eq!(&buf[0..8], &0x1122_3344_5566_7788i64.to_be_bytes());
            assert_eq!(&buf[16..36], &[0xc4; 20]);
            let mut response = Vec::new();
            response.extend_from_slice(&2i32.to_be_bytes());
            response.extend_from_slice(&echoed_transaction(&buf, 12));
            response.extend_from_slice(&7i32.to_be_bytes());
            response.extend_from_slice(&3i32.to_be_bytes());
            response.extend_from_slice(&2i32.to_be_bytes());
            socket.send_to(&response, from).unwrap();

            // Announce: interval 1800, one compact peer
            let (received, from) = socket.recv_from(&mut buf).unwrap();
            assert_eq!(received, 98);
            assert_eq!(&buf[16..36], &[0xc4; 20]);
            assert_eq!(&buf[36..56], &[0x2d; 20]);
            let mut response = Vec::new();
            response.extend_from_slice(&1i32.to_be_bytes());
            response.extend_from_slice(&echoed_transaction(&buf, 12));
            response.extend_from_slice(&1800i32.to_be_bytes());
            response.extend_from_slice(&2i32.to_be_bytes());
            response.extend_from_slice(&7i32.to_be_bytes());
            response.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
            socket.send_to(&response, from).unwrap();
        })
    }

    #[test]
    fn loopback_announce() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        let server = loopback_udp_tracker(socket);

        let mut tracker = UdpTracker::new(format!("udp://127.0.0.1:{port}/announce"));
        let announce = tracker.announce(&test_metainfo(), &test_self_peer()).unwrap();

        assert_eq!(announce.interval_secs, 1800);
        assert_eq!(announce.leechers, 2);
        assert_eq!(announce.seeders, 7);
        assert_eq!(announce.peers.len(), 1);
        assert_eq!(announce.peers[0].addr(), "127.0.0.1:6881");
        assert!(tracker.last_check() > 0);
        assert_eq!(tracker.next_check(), tracker.last_check() + 1800);
        server.join().unwrap();
    }

    #[test]
    fn loopback_tracker_error_response() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let mut buf = [0u8; 2048];
            let (_, from) = socket.recv_from(&mut buf).unwrap();
            let mut response = Vec::new();
            response.extend_from_slice(&3i32.to_be_bytes());
            response.extend_from_slice(&echoed_transaction(&buf, 12));
            response.extend_from_slice(b"torrent not registered");
            socket.send_to(&response, from).unwrap();
        });

        let mut tracker = UdpTracker::new(format!("udp://127.0.0.1:{port}/announce"));
        let err = tracker
            .announce(&test_metainfo(), &test_self_peer())
            .unwrap_err();

        assert!(err.to_string().contains("torrent not registered"));
        assert!(tracker.last_error().unwrap().contains("torrent not registered"));
        server.join().unwrap();
    }

    #[test]
    fn url_without_port_is_rejected() {
        let mut tracker = UdpTracker::new("udp://tracker.example/announce".to_string());
        assert!(tracker.announce(&test_metainfo(), &test_self_peer()).is_err());
    }
}
