//! # Progress Persistence
//!
//! The downloader records what it knows into a [`ProgressStore`]: one row
//! per download, plus its pieces, trackers and discovered peers. The store
//! is deliberately dumb; it answers upserts and field updates and nothing
//! else, so the download logic never depends on how state is persisted.
//!
//! Store failures are never allowed to abort a piece download. Callers log
//! them and move on; the content on disk is the source of truth and the
//! store can always be rebuilt from a `verify` run.
//!
//! [`JsonStore`] is the bundled implementation: every row lives in one
//! JSON document rewritten after each mutation. All methods take `&self`
//! and synchronize internally, so one handle can be shared across worker
//! threads.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Identifies a download row.
pub type DownloadId = u64;

/// Identifies a tracker row.
pub type TrackerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Created, peers not yet discovered
    Downloading,
    /// Peer discovery finished, pieces in flight
    InProgress,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerStatus {
    Announcing,
    Complete,
    Error,
}

/// Field updates for a tracker row; unset fields keep their value.
#[derive(Debug, Default)]
pub struct TrackerUpdate {
    pub status: Option<TrackerStatus>,
    pub last_error: Option<String>,
    pub seeders: Option<i64>,
    pub leechers: Option<i64>,
    pub last_check: Option<i64>,
}

/// Field updates for a download row; unset fields keep their value.
#[derive(Debug, Default)]
pub struct DownloadUpdate {
    pub status: Option<DownloadStatus>,
    pub progress_pct: Option<i64>,
    pub completed_at: Option<i64>,
    pub last_error: Option<String>,
}

/// Persistence operations the downloader depends on.
///
/// Implementations synchronize internally; every method takes `&self`.
pub trait ProgressStore: Send + Sync {
    /// Creates the download row, or returns the existing one keyed by
    /// info-hash.
    fn upsert_download(
        &self,
        info_hash: &str,
        name: &str,
        torrent_path: &str,
        total_size: u64,
    ) -> Result<DownloadId>;

    /// Records one piece hash; repeated calls for an index are ignored.
    fn add_piece(&self, download: DownloadId, index: usize, hash_hex: &str) -> Result<()>;

    /// Creates a tracker row, or returns the existing one for the URL.
    fn add_tracker(&self, download: DownloadId, announce_url: &str) -> Result<TrackerId>;

    /// Records a discovered peer, idempotent per `(download, ip, port)`.
    fn add_peer(&self, tracker: TrackerId, ip: &str, port: u16) -> Result<()>;

    fn update_tracker(&self, tracker: TrackerId, update: TrackerUpdate) -> Result<()>;

    fn update_download(&self, download: DownloadId, update: DownloadUpdate) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct DownloadRow {
    id: DownloadId,
    info_hash: String,
    name: String,
    torrent_path: String,
    total_size: u64,
    status: DownloadStatus,
    progress_pct: i64,
    completed_at: Option<i64>,
    last_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PieceRow {
    download_id: DownloadId,
    index: usize,
    hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TrackerRow {
    id: TrackerId,
    download_id: DownloadId,
    announce: String,
    status: TrackerStatus,
    last_check: i64,
    last_error: Option<String>,
    seeders: i64,
    leechers: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PeerRow {
    download_id: DownloadId,
    tracker_id: TrackerId,
    ip: String,
    port: u16,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    next_id: u64,
    downloads: Vec<DownloadRow>,
    pieces: Vec<PieceRow>,
    trackers: Vec<TrackerRow>,
    peers: Vec<PeerRow>,
}

/// File-backed [`ProgressStore`] holding all rows in one JSON document.
pub struct JsonStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl JsonStore {
    /// Opens the store, loading existing state from `path` if present.
    pub fn open(path: &Path) -> Result<JsonStore> {
        let state = if path.exists() {
            let content = fs::read(path)
                .with_context(|| format!("reading state file {}", path.display()))?;
            serde_json::from_slice(&content)
                .with_context(|| format!("parsing state file {}", path.display()))?
        } else {
            State::default()
        };

        Ok(JsonStore {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    fn save(&self, state: &State) -> Result<()> {
        let content = serde_json::to_vec_pretty(state).context("serializing state")?;
        fs::write(&self.path, content)
            .with_context(|| format!("writing state file {}", self.path.display()))
    }

    fn next_id(state: &mut State) -> u64 {
        state.next_id += 1;
        state.next_id
    }
}

impl ProgressStore for JsonStore {
    fn upsert_download(
        &self,
        info_hash: &str,
        name: &str,
        torrent_path: &str,
        total_size: u64,
    ) -> Result<DownloadId> {
        let mut state = self.state.lock().expect("store lock");

        if let Some(row) = state.downloads.iter().find(|row| row.info_hash == info_hash) {
            return Ok(row.id);
        }

        let id = Self::next_id(&mut state);
        state.downloads.push(DownloadRow {
            id,
            info_hash: info_hash.to_string(),
            name: name.to_string(),
            torrent_path: torrent_path.to_string(),
            total_size,
            status: DownloadStatus::Downloading,
            progress_pct: 0,
            completed_at: None,
            last_error: None,
        });
        self.save(&state)?;
        Ok(id)
    }

    fn add_piece(&self, download: DownloadId, index: usize, hash_hex: &str) -> Result<()> {
        let mut state = self.state.lock().expect("store lock");

        let exists = state
            .pieces
            .iter()
            .any(|row| row.download_id == download && row.index == index);
        if exists {
            return Ok(());
        }

        state.pieces.push(PieceRow {
            download_id: download,
            index,
            hash: hash_hex.to_string(),
        });
        self.save(&state)
    }

    fn add_tracker(&self, download: DownloadId, announce_url: &str) -> Result<TrackerId> {
        let mut state = self.state.lock().expect("store lock");

        if let Some(row) = state
            .trackers
            .iter()
            .find(|row| row.download_id == download && row.announce == announce_url)
        {
            return Ok(row.id);
        }

        let id = Self::next_id(&mut state);
        state.trackers.push(TrackerRow {
            id,
            download_id: download,
            announce: announce_url.to_string(),
            status: TrackerStatus::Announcing,
            last_check: 0,
            last_error: None,
            seeders: 0,
            leechers: 0,
        });
        self.save(&state)?;
        Ok(id)
    }

    fn add_peer(&self, tracker: TrackerId, ip: &str, port: u16) -> Result<()> {
        let mut state = self.state.lock().expect("store lock");

        let download_id = state
            .trackers
            .iter()
            .find(|row| row.id == tracker)
            .map(|row| row.download_id)
            .ok_or_else(|| anyhow!("unknown tracker id {tracker}"))?;

        // Peers are unique per download, not per tracker: two trackers
        // reporting the same address yield one row.
        let exists = state
            .peers
            .iter()
            .any(|row| row.download_id == download_id && row.ip == ip && row.port == port);
        if exists {
            return Ok(());
        }

        state.peers.push(PeerRow {
            download_id,
            tracker_id: tracker,
            ip: ip.to_string(),
            port,
        });
        self.save(&state)
    }

    fn update_tracker(&self, tracker: TrackerId, update: TrackerUpdate) -> Result<()> {
        let mut state = self.state.lock().expect("store lock");

        let row = state
            .trackers
            .iter_mut()
            .find(|row| row.id == tracker)
            .ok_or_else(|| anyhow!("unknown tracker id {tracker}"))?;
        if let Some(status) = update.status {
            row.status = status;
        }
        if let Some(last_error) = update.last_error {
            row.last_error = Some(last_error);
        }
        if let Some(seeders) = update.seeders {
            row.seeders = seeders;
        }
        if let Some(leechers) = update.leechers {
            row.leechers = leechers;
        }
        if let Some(last_check) = update.last_check {
            row.last_check = last_check;
        }
        self.save(&state)
    }

    fn update_download(&self, download: DownloadId, update: DownloadUpdate) -> Result<()> {
        let mut state = self.state.lock().expect("store lock");

        let row = state
            .downloads
            .iter_mut()
            .find(|row| row.id == download)
            .ok_or_else(|| anyhow!("unknown download id {download}"))?;
        if let Some(status) = update.status {
            row.status = status;
        }
        if let Some(progress_pct) = update.progress_pct {
            row.progress_pct = progress_pct;
        }
        if let Some(completed_at) = update.completed_at {
            row.completed_at = Some(completed_at);
        }
        if let Some(last_error) = update.last_error {
            row.last_error = Some(last_error);
        }
        self.save(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, JsonStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(&dir.path().join("state.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn upsert_download_is_idempotent() {
        let (_dir, store) = temp_store();
        let first = store.upsert_download("abcd", "test", "/tmp/test.torrent", 42).unwrap();
        let second = store.upsert_download("abcd", "test", "/tmp/test.torrent", 42).unwrap();
        assert_eq!(first, second);

        let other = store.upsert_download("ef01", "other", "/tmp/other.torrent", 7).unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn peers_are_unique_per_download() {
        let (_dir, store) = temp_store();
        let download = store.upsert_download("abcd", "test", "t", 1).unwrap();
        let tracker_a = store.add_tracker(download, "http://a/announce").unwrap();
        let tracker_b = store.add_tracker(download, "http://b/announce").unwrap();

        store.add_peer(tracker_a, "10.0.0.1", 6881).unwrap();
        store.add_peer(tracker_b, "10.0.0.1", 6881).unwrap();
        store.add_peer(tracker_a, "10.0.0.1", 6882).unwrap();

        let state = store.state.lock().unwrap();
        assert_eq!(state.peers.len(), 2);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        let download = {
            let store = JsonStore::open(&path).unwrap();
            let download = store.upsert_download("abcd", "test", "t", 1).unwrap();
            store
                .update_download(
                    download,
                    DownloadUpdate {
                        status: Some(DownloadStatus::Complete),
                        progress_pct: Some(100),
                        ..Default::default()
                    },
                )
                .unwrap();
            download
        };

        let store = JsonStore::open(&path).unwrap();
        assert_eq!(store.upsert_download("abcd", "test", "t", 1).unwrap(), download);
        let state = store.state.lock().unwrap();
        assert_eq!(state.downloads[0].status, DownloadStatus::Complete);
        assert_eq!(state.downloads[0].progress_pct, 100);
    }

    #[test]
    fn update_unknown_row_is_an_error() {
        let (_dir, store) = temp_store();
        assert!(store.update_download(99, DownloadUpdate::default()).is_err());
        assert!(store.add_peer(99, "10.0.0.1", 6881).is_err());
    }
}
