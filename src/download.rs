//! # Download Orchestrator
//!
//! This module coordinates a whole download, from torrent file to verified
//! content on disk.
//!
//! ## Workflow
//!
//! 1. **Parse** the torrent file and record the download in the store
//! 2. **Announce** to every tracker in parallel, one thread per tracker
//! 3. **Merge** the returned peers, dropping duplicates and ourselves
//! 4. **Pre-allocate** every output file at its declared length, so piece
//!    writes always land in-bounds
//! 5. **Download** pieces with a worker pool fed from a shared queue
//!
//! ## Worker pool
//!
//! The piece queue starts holding every index. Workers pull an index, try
//! the candidate peers in a fixed order (sorted by `ip:port`, so retry
//! behavior is reproducible), verify the assembled piece against its SHA-1
//! digest and write it into every file it overlaps. Any failure puts the
//! index back on the queue for another worker.
//!
//! The pool holds `5 * peers` workers, clamped to 5..=20. A piece belongs
//! to exactly one worker at a time, so writes never conflict; the
//! downloaded-piece table and its counter share one mutex so the reporter
//! always sees a consistent snapshot.
//!
//! The worker that completes the final piece closes the queue. Workers
//! drain whatever is left and exit; a closed queue ignores re-enqueues.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use boring::sha::Sha1;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};

use crate::config::Config;
use crate::metainfo::{to_hex, Metainfo};
use crate::peer::{Peer, SelfPeer};
use crate::session::PeerSession;
use crate::store::{
    DownloadId, DownloadStatus, DownloadUpdate, ProgressStore, TrackerStatus, TrackerUpdate,
};
use crate::tracker::{unix_now, Tracker};

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Downloads the content described by a torrent file.
///
/// Peer discovery failures are tolerated per tracker; having no usable
/// tracker at all is fatal, while having no peers ends the run cleanly so
/// a later invocation can retry.
pub fn download_torrent(
    torrent_path: &Path,
    config: &Config,
    store: Arc<dyn ProgressStore>,
) -> Result<()> {
    info!("downloading torrent: {}", torrent_path.display());

    let content = fs::read(torrent_path)
        .with_context(|| format!("reading torrent file {}", torrent_path.display()))?;
    let metainfo = Arc::new(Metainfo::from_bytes(&content)?);
    info!("loaded torrent:\n{metainfo}");

    // Keep a copy of the torrent file next to the state
    let torrent_filename = torrent_path
        .file_name()
        .ok_or_else(|| anyhow!("invalid torrent path {}", torrent_path.display()))?;
    let cache_path = config.cache_dir.join(torrent_filename);
    fs::copy(torrent_path, &cache_path)
        .with_context(|| format!("copying torrent into {}", cache_path.display()))?;

    let download = store.upsert_download(
        &metainfo.info_hash_hex(),
        &metainfo.name,
        &cache_path.display().to_string(),
        metainfo.total_length,
    )?;
    for (index, hash) in metainfo.pieces.iter().enumerate() {
        if let Err(err) = store.add_piece(download, index, &to_hex(hash)) {
            warn!("could not record piece {index}: {err:#}");
        }
    }

    let mut trackers = Vec::new();
    for announce in &metainfo.announce_list {
        match Tracker::new(announce) {
            Ok(tracker) => trackers.push(tracker),
            Err(err) => warn!("skipping tracker {announce}: {err:#}"),
        }
    }
    if trackers.is_empty() {
        return Err(anyhow!("no valid trackers found"));
    }

    let me = SelfPeer::detect();
    let peers = announce_to_trackers(trackers, &metainfo, &me, store.clone(), download);

    if let Err(err) = store.update_download(
        download,
        DownloadUpdate {
            status: Some(DownloadStatus::InProgress),
            ..Default::default()
        },
    ) {
        warn!("could not update download status: {err:#}");
    }

    info!("found {} peers for download", peers.len());
    if peers.is_empty() {
        warn!("no peers found for download, will retry later");
        return Ok(());
    }

    // Single-file torrents land directly under the download directory;
    // their one entry is already named after the torrent. Multi-file
    // torrents get a directory named after the torrent.
    let download_path = if metainfo.files.len() == 1 && metainfo.files[0].path == metainfo.name {
        config.download_dir.clone()
    } else {
        config.download_dir.join(&metainfo.name)
    };
    let result = fs::create_dir_all(&download_path)
        .with_context(|| format!("creating download directory {}", download_path.display()))
        .and_then(|_| {
            info!("starting download of pieces");
            run(&metainfo, &peers, &download_path, store.clone(), download, me.id)
        });

    if let Err(err) = &result {
        let _ = store.update_download(
            download,
            DownloadUpdate {
                status: Some(DownloadStatus::Error),
                last_error: Some(format!("{err:#}")),
                ..Default::default()
            },
        );
    }
    result
}

/// Announces to every tracker in parallel and merges the peers they return.
///
/// Each tracker gets its own thread and its own store row; a failing
/// tracker is recorded and skipped. The result maps `ip:port` to the peer,
/// so duplicates across trackers collapse and iteration order is stable.
fn announce_to_trackers(
    trackers: Vec<Tracker>,
    metainfo: &Arc<Metainfo>,
    me: &SelfPeer,
    store: Arc<dyn ProgressStore>,
    download: DownloadId,
) -> BTreeMap<String, Peer> {
    let merged: Arc<Mutex<BTreeMap<String, Peer>>> = Arc::new(Mutex::new(BTreeMap::new()));

    let mut handles = Vec::new();
    for mut tracker in trackers {
        let metainfo = Arc::clone(metainfo);
        let me = me.clone();
        let store = store.clone();
        let merged = Arc::clone(&merged);

        handles.push(thread::spawn(move || {
            let announce_url = tracker.announce_url().to_string();
            info!("getting peers from tracker: {announce_url}");

            let tracker_row = match store.add_tracker(download, &announce_url) {
                Ok(id) => Some(id),
                Err(err) => {
                    warn!("could not record tracker {announce_url}: {err:#}");
                    None
                }
            };

            match tracker.announce(&metainfo, &me) {
                Ok(announce) => {
                    info!("got {} peers from tracker {announce_url}", announce.peers.len());
                    debug!(
                        "tracker {announce_url} asks for re-announce in {}s (at {})",
                        announce.interval_secs,
                        tracker.next_check()
                    );
                    if let Some(row) = tracker_row {
                        if let Err(err) = store.update_tracker(
                            row,
                            TrackerUpdate {
                                status: Some(TrackerStatus::Complete),
                                seeders: Some(announce.seeders),
                                leechers: Some(announce.leechers),
                                last_check: Some(tracker.last_check()),
                                ..Default::default()
                            },
                        ) {
                            warn!("could not update tracker {announce_url}: {err:#}");
                        }
                    }

                    let mut merged = merged.lock().expect("peers lock");
                    for peer in announce.peers {
                        if peer.addr() == me.addr() || peer.ip == "0.0.0.0" {
                            continue;
                        }
                        if !merged.contains_key(&peer.addr()) {
                            if let Some(row) = tracker_row {
                                if let Err(err) = store.add_peer(row, &peer.ip, peer.port) {
                                    warn!("could not record peer {}: {err:#}", peer.addr());
                                }
                            }
                            merged.insert(peer.addr(), peer);
                        }
                    }
                }
                Err(err) => {
                    error!("error getting peers from tracker {announce_url}: {err:#}");
                    if let Some(row) = tracker_row {
                        let message = tracker
                            .last_error()
                            .map(String::from)
                            .unwrap_or_else(|| err.to_string());
                        if let Err(err) = store.update_tracker(
                            row,
                            TrackerUpdate {
                                status: Some(TrackerStatus::Error),
                                last_error: Some(message),
                                last_check: Some(unix_now()),
                                ..Default::default()
                            },
                        ) {
                            warn!("could not update tracker {announce_url}: {err:#}");
                        }
                    }
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.join();
    }

    let merged = merged.lock().expect("peers lock");
    merged.clone()
}

/// A multi-producer queue of piece indices with close-and-drain semantics.
///
/// Closing drops the only sender: receivers drain whatever is buffered,
/// then see a disconnect and stop. Re-enqueues after close are ignored.
struct PieceQueue {
    tx: Mutex<Option<Sender<usize>>>,
    rx: Receiver<usize>,
}

impl PieceQueue {
    fn new(num_pieces: usize) -> PieceQueue {
        let (tx, rx) = crossbeam_channel::unbounded();
        for index in 0..num_pieces {
            tx.send(index).expect("channel open");
        }
        PieceQueue {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// Blocks for the next index; `None` once closed and drained.
    fn pop(&self) -> Option<usize> {
        self.rx.recv().ok()
    }

    fn push(&self, index: usize) {
        if let Some(tx) = self.tx.lock().expect("queue lock").as_ref() {
            let _ = tx.send(index);
        }
    }

    fn close(&self) {
        self.tx.lock().expect("queue lock").take();
    }
}

/// Downloaded-piece accounting; the table and counter stay consistent by
/// sharing one mutex.
struct Progress {
    downloaded: Vec<bool>,
    completed: usize,
}

/// Everything a worker thread needs.
#[derive(Clone)]
struct DownloadJob {
    metainfo: Arc<Metainfo>,
    peers: Arc<Vec<Peer>>,
    queue: Arc<PieceQueue>,
    progress: Arc<Mutex<Progress>>,
    output_root: PathBuf,
    peer_id: [u8; 20],
    bar: Arc<ProgressBar>,
}

/// Runs the piece download across a worker pool until the torrent is
/// complete or the queue drains with pieces missing.
pub fn run(
    metainfo: &Metainfo,
    peers: &BTreeMap<String, Peer>,
    output_root: &Path,
    store: Arc<dyn ProgressStore>,
    download: DownloadId,
    peer_id: [u8; 20],
) -> Result<()> {
    create_empty_files(metainfo, output_root).context("pre-allocating files")?;

    let total_pieces = metainfo.num_pieces();
    if total_pieces == 0 {
        return Err(anyhow!("torrent has no pieces"));
    }

    let metainfo = Arc::new(metainfo.clone());
    let peer_list: Arc<Vec<Peer>> = Arc::new(peers.values().cloned().collect());
    let queue = Arc::new(PieceQueue::new(total_pieces));
    let progress = Arc::new(Mutex::new(Progress {
        downloaded: vec![false; total_pieces],
        completed: 0,
    }));

    let worker_count = (peer_list.len() * 5).clamp(5, 20);
    info!(
        "starting download of {total_pieces} pieces with {} peers and {worker_count} workers",
        peer_list.len()
    );

    let bar = Arc::new(ProgressBar::new(metainfo.total_length));
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
            .expect("valid template")
            .progress_chars("#>-"),
    );

    // Reporter: persist a progress snapshot every few seconds until the
    // workers are done.
    let (done_tx, done_rx) = bounded::<()>(0);
    let reporter = {
        let progress = Arc::clone(&progress);
        let store = store.clone();
        thread::spawn(move || {
            let ticker = tick(REPORT_INTERVAL);
            loop {
                select! {
                    recv(ticker) -> _ => {
                        let completed = progress.lock().expect("progress lock").completed;
                        let pct = (completed * 100 / total_pieces) as i64;
                        info!("download progress: {pct}% ({completed}/{total_pieces} pieces)");
                        if let Err(err) = store.update_download(
                            download,
                            DownloadUpdate { progress_pct: Some(pct), ..Default::default() },
                        ) {
                            warn!("could not persist progress: {err:#}");
                        }
                    }
                    recv(done_rx) -> _ => return,
                }
            }
        })
    };

    let job = DownloadJob {
        metainfo: Arc::clone(&metainfo),
        peers: peer_list,
        queue,
        progress: Arc::clone(&progress),
        output_root: output_root.to_path_buf(),
        peer_id,
        bar: Arc::clone(&bar),
    };

    let mut workers = Vec::new();
    for worker_id in 0..worker_count {
        let job = job.clone();
        workers.push(thread::spawn(move || worker_loop(worker_id, job)));
    }
    for worker in workers {
        let _ = worker.join();
    }
    drop(done_tx);
    let _ = reporter.join();

    let remaining = {
        let progress = progress.lock().expect("progress lock");
        progress.downloaded.iter().filter(|&&done| !done).count()
    };
    if remaining > 0 {
        return Err(anyhow!("download incomplete: {remaining} pieces missing"));
    }

    bar.finish();
    if let Err(err) = store.update_download(
        download,
        DownloadUpdate {
            status: Some(DownloadStatus::Complete),
            progress_pct: Some(100),
            completed_at: Some(unix_now()),
            ..Default::default()
        },
    ) {
        warn!("could not mark download complete: {err:#}");
    }
    info!("download completed successfully");
    Ok(())
}

/// One worker: pull indices until the queue closes, re-enqueueing every
/// piece that fails to arrive, verify or persist.
fn worker_loop(worker_id: usize, job: DownloadJob) {
    while let Some(index) = job.queue.pop() {
        // Another worker may have finished this piece while it sat queued
        if job.progress.lock().expect("progress lock").downloaded[index] {
            continue;
        }

        let piece = match fetch_piece(&job.metainfo, &job.peers, index, job.peer_id) {
            Ok(piece) => piece,
            Err(err) => {
                warn!("worker {worker_id}: {err:#}");
                job.queue.push(index);
                continue;
            }
        };

        let mut hasher = Sha1::new();
        hasher.update(&piece);
        if hasher.finish() != job.metainfo.pieces[index] {
            warn!("piece {index} hash mismatch, retrying");
            job.queue.push(index);
            continue;
        }

        if let Err(err) = write_piece(&job.metainfo, index, &piece, &job.output_root) {
            error!("worker {worker_id} failed to write piece {index}: {err:#}");
            job.queue.push(index);
            continue;
        }

        let mut progress = job.progress.lock().expect("progress lock");
        if !progress.downloaded[index] {
            progress.downloaded[index] = true;
            progress.completed += 1;
            job.bar.inc(job.metainfo.piece_len(index));
        }
        // The worker that completes the last piece shuts the pool down
        if progress.completed == job.metainfo.num_pieces() {
            job.queue.close();
        }
    }
}

/// Tries the candidate peers in order until one delivers the piece.
///
/// One session per attempt; the session is dropped (closing the
/// connection) whether it succeeds or fails.
fn fetch_piece(
    metainfo: &Metainfo,
    peers: &[Peer],
    index: usize,
    peer_id: [u8; 20],
) -> Result<Vec<u8>> {
    let piece_length = metainfo.piece_len(index) as u32;

    for peer in peers {
        debug!("attempting to download piece {index} from peer {}", peer.addr());

        let mut session =
            match PeerSession::connect(peer, metainfo.info_hash, peer_id, metainfo.num_pieces()) {
                Ok(session) => session,
                Err(err) => {
                    debug!("could not open session with {}: {err:#}", peer.addr());
                    continue;
                }
            };

        if !session.has_piece(index) {
            debug!("peer {} does not have piece {index}", peer.addr());
            continue;
        }

        match session.download_piece(index, piece_length) {
            Ok(piece) => return Ok(piece),
            Err(err) => {
                debug!("failed to download piece {index} from {}: {err:#}", peer.addr());
                continue;
            }
        }
    }

    Err(anyhow!("no peer delivered piece {index}"))
}

/// Creates every output file at its declared length so later piece writes
/// always land in-bounds.
fn create_empty_files(metainfo: &Metainfo, output_root: &Path) -> Result<()> {
    for file in &metainfo.files {
        let path = output_root.join(&file.path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let handle =
            File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        handle
            .set_len(file.length)
            .with_context(|| format!("allocating {}", path.display()))?;
    }
    Ok(())
}

/// Writes a verified piece into every file its byte range overlaps.
///
/// For each overlapping file, the write offset is the piece's position
/// relative to the file start, and the slice taken from the piece buffer is
/// the file's position relative to the piece start.
fn write_piece(metainfo: &Metainfo, index: usize, piece: &[u8], output_root: &Path) -> Result<()> {
    let piece_start = metainfo.piece_offset(index);
    let piece_end = piece_start + piece.len() as u64;

    let mut file_start: u64 = 0;
    for file in &metainfo.files {
        let file_end = file_start + file.length;

        if piece_start < file_end && piece_end > file_start {
            let write_offset = piece_start.saturating_sub(file_start);
            let slice_start = file_start.saturating_sub(piece_start);
            let slice_len = piece_end.min(file_end) - piece_start.max(file_start);

            let path = output_root.join(&file.path);
            let mut handle = OpenOptions::new()
                .write(true)
                .open(&path)
                .with_context(|| format!("opening {}", path.display()))?;
            handle.seek(SeekFrom::Start(write_offset))?;
            handle.write_all(&piece[slice_start as usize..(slice_start + slice_len) as usize])?;
        }

        file_start = file_end;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::FileEntry;

    /// Builds a metainfo over the given file layout with zeroed digests.
    fn layout(files: &[(&str, u64)], piece_length: u64) -> Metainfo {
        let total_length: u64 = files.iter().map(|(_, length)| length).sum();
        let num_pieces = total_length.div_ceil(piece_length) as usize;

        let mut offset = 0u64;
        let file_entries = files
            .iter()
            .map(|(path, length)| {
                let entry = FileEntry {
                    path: path.to_string(),
                    length: *length,
                    first_piece: (offset / piece_length) as usize,
                    last_piece: ((offset + length).saturating_sub(1) / piece_length) as usize,
                };
                offset += length;
                entry
            })
            .collect();

        Metainfo {
            announce_list: vec![],
            name: "test".to_string(),
            url_list: vec![],
            comment: None,
            created_by: None,
            creation_date: None,
            files: file_entries,
            piece_length,
            pieces: vec![[0; 20]; num_pieces],
            info_hash: [0; 20],
            total_length,
            is_private: false,
        }
    }

    #[test]
    fn pre_allocation_sizes_every_file() {
        let metainfo = layout(&[("a", 3), ("sub/b", 5)], 4);
        let dir = tempfile::tempdir().unwrap();

        create_empty_files(&metainfo, dir.path()).unwrap();

        assert_eq!(fs::metadata(dir.path().join("a")).unwrap().len(), 3);
        assert_eq!(fs::metadata(dir.path().join("sub/b")).unwrap().len(), 5);
    }

    #[test]
    fn writeback_spans_files() {
        // piece 0 covers all of `a` and the first byte of `b`
        let metainfo = layout(&[("a", 3), ("b", 5)], 4);
        let dir = tempfile::tempdir().unwrap();
        create_empty_files(&metainfo, dir.path()).unwrap();

        write_piece(&metainfo, 0, &[1, 2, 3, 4], dir.path()).unwrap();
        write_piece(&metainfo, 1, &[5, 6, 7, 8], dir.path()).unwrap();

        assert_eq!(fs::read(dir.path().join("a")).unwrap(), [1, 2, 3]);
        assert_eq!(fs::read(dir.path().join("b")).unwrap(), [4, 5, 6, 7, 8]);
    }

    #[test]
    fn writeback_reconstructs_any_buffer() {
        let metainfo = layout(&[("a", 7), ("b", 2), ("c", 11)], 5);
        let dir = tempfile::tempdir().unwrap();
        create_empty_files(&metainfo, dir.path()).unwrap();

        let buffer: Vec<u8> = (0..metainfo.total_length as u8).collect();
        for index in 0..metainfo.num_pieces() {
            let start = metainfo.piece_offset(index) as usize;
            let end = start + metainfo.piece_len(index) as usize;
            write_piece(&metainfo, index, &buffer[start..end], dir.path()).unwrap();
        }

        let mut reassembled = Vec::new();
        for file in &metainfo.files {
            reassembled.extend(fs::read(dir.path().join(&file.path)).unwrap());
        }
        assert_eq!(reassembled, buffer);
    }

    #[test]
    fn run_downloads_whole_torrent_from_loopback_peer() {
        use crate::handshake::Handshake;
        use crate::message::{self, Message};
        use crate::store::JsonStore;
        use byteorder::{BigEndian, ReadBytesExt};
        use std::io::Read;
        use std::net::{TcpListener, TcpStream};
        use std::sync::atomic::{AtomicUsize, Ordering};

        const INFO_HASH: [u8; 20] = [0x55; 20];

        /// Serves piece requests for the given content on one connection.
        /// When `corrupt` is set, every block is zeroed so the client's
        /// hash check must fail and the piece must be retried.
        fn serve_one(mut conn: TcpStream, content: Vec<u8>, num_pieces: usize, corrupt: bool) {
            let mut handshake_buf = [0u8; 68];
            if conn.read_exact(&mut handshake_buf).is_err() {
                return;
            }
            let _ = conn.write_all(&Handshake::new(INFO_HASH, [0x44; 20]).serialize());

            let bits = vec![0xff; num_pieces.div_ceil(8)];
            let _ = conn
                .write_all(&Message::new_with_payload(message::MESSAGE_BITFIELD, bits).serialize());
            let _ = conn.write_all(&Message::new(message::MESSAGE_UNCHOKE).serialize());

            loop {
                let Ok(length) = conn.read_u32::<BigEndian>() else {
                    return;
                };
                let mut body = vec![0u8; length as usize];
                if conn.read_exact(&mut body).is_err() {
                    return;
                }
                if body.is_empty() || body[0] != message::MESSAGE_REQUEST {
                    continue;
                }

                let mut cursor = std::io::Cursor::new(&body[1..]);
                let index = cursor.read_u32::<BigEndian>().unwrap() as usize;
                let begin = cursor.read_u32::<BigEndian>().unwrap() as usize;
                let block_len = cursor.read_u32::<BigEndian>().unwrap() as usize;

                let start = index * 4 + begin;
                let mut block = content[start..start + block_len].to_vec();
                if corrupt {
                    block.fill(0);
                }

                let mut payload = Vec::new();
                payload.extend_from_slice(&(index as u32).to_be_bytes());
                payload.extend_from_slice(&(begin as u32).to_be_bytes());
                payload.extend_from_slice(&block);
                if conn
                    .write_all(
                        &Message::new_with_payload(message::MESSAGE_PIECE, payload).serialize(),
                    )
                    .is_err()
                {
                    return;
                }
            }
        }

        // Two pieces over two files; the first connection serves garbage
        let mut metainfo = layout(&[("a", 3), ("b", 5)], 4);
        let content: Vec<u8> = (1u8..=8).collect();
        metainfo.pieces = content
            .chunks(4)
            .map(|chunk| {
                let mut hasher = Sha1::new();
                hasher.update(chunk);
                hasher.finish()
            })
            .collect();
        metainfo.info_hash = INFO_HASH;
        let num_pieces = metainfo.num_pieces();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        {
            let content = content.clone();
            let connections = Arc::clone(&connections);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(conn) = stream else { return };
                    let content = content.clone();
                    let corrupt = connections.fetch_add(1, Ordering::SeqCst) == 0;
                    thread::spawn(move || serve_one(conn, content, num_pieces, corrupt));
                }
            });
        }

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonStore::open(&dir.path().join("state.db")).unwrap());
        let download = store
            .upsert_download(&metainfo.info_hash_hex(), "test", "t", metainfo.total_length)
            .unwrap();

        let peer = Peer::new("127.0.0.1".to_string(), port);
        let mut peers = BTreeMap::new();
        peers.insert(peer.addr(), peer);

        let output_root = dir.path().join("out");
        fs::create_dir_all(&output_root).unwrap();
        run(&metainfo, &peers, &output_root, store.clone(), download, [0x66; 20]).unwrap();

        assert_eq!(fs::read(output_root.join("a")).unwrap(), [1, 2, 3]);
        assert_eq!(fs::read(output_root.join("b")).unwrap(), [4, 5, 6, 7, 8]);
        // The corrupted first delivery forced at least one retry connection
        assert!(connections.load(Ordering::SeqCst) > num_pieces);

        let state = fs::read_to_string(dir.path().join("state.db")).unwrap();
        assert!(state.contains("\"complete\""));
        assert!(state.contains("\"progress_pct\": 100"));
    }

    #[test]
    fn queue_closes_and_drains() {
        let queue = PieceQueue::new(3);
        assert_eq!(queue.pop(), Some(0));
        queue.push(0);
        queue.close();
        // Closed queues still drain what they hold, then stop
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.pop(), None);
        // Re-enqueue after close is ignored
        queue.push(7);
        assert_eq!(queue.pop(), None);
    }
}
