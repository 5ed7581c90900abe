//! # Tracker Dispatch
//!
//! A tracker mediates peer discovery for a torrent. Two wire variants are
//! supported behind one capability: HTTP/HTTPS announces (bencoded
//! responses over a GET request) and UDP announces (BEP 15 binary frames).
//!
//! [`Tracker::new`] selects the variant from the announce URL scheme; a URL
//! without a scheme is treated as plain HTTP. Unsupported schemes (for
//! example `wss`) are an error the caller is expected to skip over.

use anyhow::{anyhow, Result};
use url::Url;

use crate::metainfo::Metainfo;
use crate::peer::{Peer, SelfPeer};
use crate::tracker_http::HttpTracker;
use crate::tracker_udp::UdpTracker;

/// The outcome of one successful announce.
#[derive(Debug, Clone)]
pub struct Announce {
    /// Peers returned by the tracker, in response order
    pub peers: Vec<Peer>,
    /// Peers with the complete content
    pub seeders: i64,
    /// Peers still downloading
    pub leechers: i64,
    /// Seconds the tracker asks us to wait before the next announce
    pub interval_secs: i64,
}

/// A tracker for one announce URL, HTTP or UDP.
pub enum Tracker {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl Tracker {
    /// Builds a tracker for the given announce URL, selecting the wire
    /// variant by URL scheme.
    pub fn new(announce: &str) -> Result<Tracker> {
        let scheme = match Url::parse(announce) {
            Ok(url) => url.scheme().to_string(),
            // A bare host:port/path is treated as plain HTTP
            Err(url::ParseError::RelativeUrlWithoutBase) => "http".to_string(),
            Err(err) => return Err(anyhow!("invalid tracker url {announce}: {err}")),
        };

        match scheme.as_str() {
            "http" | "https" => Ok(Tracker::Http(HttpTracker::new(announce.to_string()))),
            "udp" => Ok(Tracker::Udp(UdpTracker::new(announce.to_string()))),
            other => Err(anyhow!("unsupported tracker protocol: {other}")),
        }
    }

    /// The announce URL this tracker was built from.
    pub fn announce_url(&self) -> &str {
        match self {
            Tracker::Http(tracker) => tracker.announce_url(),
            Tracker::Udp(tracker) => tracker.announce_url(),
        }
    }

    /// Announces our presence and returns the tracker's peer list.
    pub fn announce(&mut self, metainfo: &Metainfo, me: &SelfPeer) -> Result<Announce> {
        match self {
            Tracker::Http(tracker) => tracker.announce(metainfo, me),
            Tracker::Udp(tracker) => tracker.announce(metainfo, me),
        }
    }

    /// Unix time of the last completed announce, 0 when never checked.
    pub fn last_check(&self) -> i64 {
        match self {
            Tracker::Http(tracker) => tracker.last_check(),
            Tracker::Udp(tracker) => tracker.last_check(),
        }
    }

    /// Unix time after which the tracker wants the next announce.
    pub fn next_check(&self) -> i64 {
        match self {
            Tracker::Http(tracker) => tracker.next_check(),
            Tracker::Udp(tracker) => tracker.next_check(),
        }
    }

    /// The most recent announce failure, if any.
    pub fn last_error(&self) -> Option<&str> {
        match self {
            Tracker::Http(tracker) => tracker.last_error(),
            Tracker::Udp(tracker) => tracker.last_error(),
        }
    }
}

/// Current unix time in seconds.
pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
