//! # Content Verifier
//!
//! Re-hashes already-downloaded content against a torrent's piece digests
//! without touching the network or the store.
//!
//! For piece boundaries, the content is one long stream: the concatenation
//! of every file in listed order. Pieces may span file boundaries, so the
//! verifier fills a piece-sized window from as many files as it takes
//! before hashing, instead of treating files individually.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use boring::sha::Sha1;
use log::info;

use crate::metainfo::Metainfo;

/// Loads a torrent file and verifies the content at `content_path`.
pub fn verify_torrent(torrent_path: &Path, content_path: &Path) -> Result<()> {
    let content = std::fs::read(torrent_path)
        .with_context(|| format!("reading torrent file {}", torrent_path.display()))?;
    let metainfo = Metainfo::from_bytes(&content)?;
    verify_content(&metainfo, content_path)
}

/// Verifies every piece of `metainfo` against the files under
/// `content_path`.
///
/// # Errors
///
/// Returns an error naming the first missing file, or the index of the
/// first piece whose hash does not match.
pub fn verify_content(metainfo: &Metainfo, content_path: &Path) -> Result<()> {
    // All files must exist before any hashing starts
    for file in &metainfo.files {
        let path = content_path.join(&file.path);
        if !path.exists() {
            return Err(anyhow!("missing file: {}", path.display()));
        }
    }

    let piece_length = metainfo.piece_length as usize;
    let mut piece_buf = vec![0u8; piece_length];
    let mut filled = 0;
    let mut piece_index = 0;

    for file in &metainfo.files {
        let path = content_path.join(&file.path);
        info!("checking {}", file.path);
        let mut handle =
            File::open(&path).with_context(|| format!("opening {}", path.display()))?;

        loop {
            let read = handle
                .read(&mut piece_buf[filled..])
                .with_context(|| format!("reading {}", path.display()))?;
            if read == 0 {
                break;
            }
            filled += read;

            if filled == piece_length {
                check_piece(metainfo, piece_index, &piece_buf)?;
                piece_index += 1;
                filled = 0;
            }
        }
    }

    // The final window is shorter unless the total is piece-aligned
    if filled > 0 {
        check_piece(metainfo, piece_index, &piece_buf[..filled])?;
        piece_index += 1;
    }

    if piece_index != metainfo.num_pieces() {
        return Err(anyhow!(
            "content has {piece_index} pieces but the torrent declares {}",
            metainfo.num_pieces()
        ));
    }

    Ok(())
}

fn check_piece(metainfo: &Metainfo, index: usize, data: &[u8]) -> Result<()> {
    if index >= metainfo.num_pieces() {
        return Err(anyhow!("content is longer than the torrent declares"));
    }

    let mut hasher = Sha1::new();
    hasher.update(data);
    if hasher.finish() != metainfo.pieces[index] {
        return Err(anyhow!("piece {index} is corrupted"));
    }
    Ok(())
}
