//! # HTTP Tracker
//!
//! Announces over HTTP/HTTPS: a GET request whose query string carries the
//! raw 20-byte info-hash and peer id (percent-encoded byte by byte), and a
//! bencoded response dictionary with the peer list and swarm counts.
//!
//! The `peers` key comes in two forms and both are accepted: a byte string
//! of packed 6-byte records, or a list of dictionaries with `ip`/`port`
//! (and optionally `peer id`) entries.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::warn;

use crate::bencode::{self, Value};
use crate::metainfo::Metainfo;
use crate::peer::{self, Peer, SelfPeer};
use crate::tracker::{unix_now, Announce};

/// A tracker reached over HTTP or HTTPS.
pub struct HttpTracker {
    announce_url: String,
    last_check: i64,
    next_check: i64,
    last_error: Option<String>,
}

impl HttpTracker {
    pub fn new(announce_url: String) -> HttpTracker {
        HttpTracker {
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

    /// Announces to the tracker and parses its peer list.
    pub fn announce(&mut self, metainfo: &Metainfo, me: &SelfPeer) -> Result<Announce> {
        let result = self.try_announce(metainfo, me);
        match &result {
            Ok(_) => self.last_error = None,
            Err(err) => self.last_error = Some(err.to_string()),
        }
        result
    }

    fn try_announce(&mut self, metainfo: &Metainfo, me: &SelfPeer) -> Result<Announce> {
        let url = self.build_announce_url(metainfo, me);

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("building http client")?;
        let response = client
            .get(&url)
            .send()
            .with_context(|| format!("announcing to {}", self.announce_url))?;

        self.last_check = unix_now();

        let status = response.status();
        let body = response.bytes().context("reading tracker response")?;
        if status.as_u16() != 200 {
            return Err(anyhow!(
                "tracker returned status {}: {}",
                status.as_u16(),
                String::from_utf8_lossy(&body)
            ));
        }

        let (root, _) = bencode::decode(&body).context("decoding tracker response")?;
        let dict = root
            .as_dict()
            .ok_or_else(|| anyhow!("tracker response is not a dictionary"))?;

        if let Some(reason) = dict.get(b"failure reason".as_slice()).and_then(|v| v.as_text()) {
            return Err(anyhow!("tracker rejected announce: {reason}"));
        }
        if let Some(warning) = dict.get(b"warning message".as_slice()).and_then(|v| v.as_text()) {
            warn!("tracker {} warning: {warning}", self.announce_url);
        }

        let seeders = dict
            .get(b"complete".as_slice())
            .and_then(Value::as_int)
            .unwrap_or(0);
        let leechers = dict
            .get(b"incomplete".as_slice())
            .and_then(Value::as_int)
            .unwrap_or(0);
        let interval_secs = dict
            .get(b"interval".as_slice())
            .and_then(Value::as_int)
            .unwrap_or(0);
        if interval_secs > 0 {
            self.next_check = self.last_check + interval_secs;
        }

        let peers = match dict.get(b"peers".as_slice()) {
            Some(Value::Bytes(packed)) => peer::parse_compact_peers(packed)?,
            Some(Value::List(entries)) => parse_peer_dicts(entries)?,
            Some(_) => return Err(anyhow!("tracker peers field has invalid type")),
            None => Vec::new(),
        };

        Ok(Announce {
            peers,
            seeders,
            leechers,
            interval_secs,
        })
    }

    fn build_announce_url(&self, metainfo: &Metainfo, me: &SelfPeer) -> String {
        let query = format!(
            "info_hash={}&peer_id={}&ip={}&port={}&uploaded=0&downloaded=0&left={}&event=started",
            percent_encode_binary(&metainfo.info_hash),
            percent_encode_binary(&me.id),
            me.ip,
            me.port,
            metainfo.total_length,
        );

        let mut url = self.announce_url.clone();
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(&query);
        url
    }
}

/// Parses the list-of-dictionaries form of the `peers` key.
fn parse_peer_dicts(entries: &[Value]) -> Result<Vec<Peer>> {
    let mut peers = Vec::with_capacity(entries.len());
    for entry in entries {
        let dict = entry
            .as_dict()
            .ok_or_else(|| anyhow!("tracker peer entry is not a dictionary"))?;
        let ip = dict
            .get(b"ip".as_slice())
            .and_then(|v| v.as_text())
            .ok_or_else(|| anyhow!("tracker peer entry has no ip"))?;
        let port = dict
            .get(b"port".as_slice())
            .and_then(Value::as_int)
            .filter(|&port| (0..=u16::MAX as i64).contains(&port))
            .ok_or_else(|| anyhow!("tracker peer entry has no valid port"))?;

        let mut peer = Peer::new(ip, port as u16);
        if let Some(id) = dict.get(b"peer id".as_slice()).and_then(Value::as_bytes) {
            if id.len() == 20 {
                peer.id = Some(id.try_into().expect("20 bytes"));
            }
        }
        peers.push(peer);
    }
    Ok(peers)
}

/// Percent-encodes every byte as %XX, as required for raw binary query
/// parameters like the info-hash.
fn percent_encode_binary(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(data.len() * 3);

    for &byte in data {
        encoded.push('%');
        encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        encoded.push(HEX_DIGITS[(byte & 0x0f) as usize] as char);
    }

    encoded
}
