//! # Torrent Metainfo
//!
//! This module parses a bencoded `.torrent` file into a typed descriptor and
//! derives everything the downloader needs from it:
//!
//! - the unique announce URL list (tracker tiers flattened, duplicates
//!   dropped, the top-level `announce` folded in)
//! - the file list with per-file piece index ranges; single-file torrents
//!   are normalized into a one-element list named after the torrent
//! - piece geometry: every piece covers `piece_length` bytes except the
//!   last, which covers the remainder
//! - the info-hash: SHA-1 over the `info` dictionary exactly as encoded in
//!   the source bytes (see [`crate::bencode::info_span`])
//!
//! A `Metainfo` is immutable once constructed.

use std::fmt;

use anyhow::{anyhow, Context, Result};
use boring::sha::Sha1;

use crate::bencode::{self, Value};

const SHA1_HASH_SIZE: usize = 20;

/// A parsed torrent descriptor.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Unique announce URLs, in tier order
    pub announce_list: Vec<String>,
    /// Suggested directory (multi-file) or file (single-file) name
    pub name: String,
    /// Webseed URLs, carried but not fetched
    pub url_list: Vec<String>,
    /// Free-form comment from the torrent author
    pub comment: Option<String>,
    /// Client that created the torrent
    pub created_by: Option<String>,
    /// Creation time, unix seconds
    pub creation_date: Option<i64>,
    /// Files in listed order; single-file mode is normalized to one entry
    pub files: Vec<FileEntry>,
    /// Bytes per piece (the last piece may be shorter)
    pub piece_length: u64,
    /// 20-byte SHA-1 digest per piece
    pub pieces: Vec<[u8; 20]>,
    /// SHA-1 of the raw info dictionary bytes
    pub info_hash: [u8; 20],
    /// Sum of all file lengths
    pub total_length: u64,
    /// Whether the torrent forbids peer sources other than its trackers
    pub is_private: bool,
}

/// One file within a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the torrent root, components joined with `/`
    pub path: String,
    /// File size in bytes
    pub length: u64,
    /// Index of the first piece containing bytes of this file
    pub first_piece: usize,
    /// Index of the last piece containing bytes of this file
    pub last_piece: usize,
}

impl Metainfo {
    /// Parses torrent file bytes into a `Metainfo`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bencode is malformed, required fields are
    /// missing, the pieces blob is not a multiple of 20 bytes, or the piece
    /// count does not match the declared lengths.
    pub fn from_bytes(content: &[u8]) -> Result<Metainfo> {
        let (root, _) = bencode::decode(content).context("decoding torrent file")?;
        let root_dict = root
            .as_dict()
            .ok_or_else(|| anyhow!("torrent root is not a dictionary"))?;
        let info_dict = root_dict
            .get(b"info".as_slice())
            .and_then(Value::as_dict)
            .ok_or_else(|| anyhow!("torrent has no info dictionary"))?;

        // announce-list tiers first, then the top-level announce if new
        let mut announce_list: Vec<String> = Vec::new();
        if let Some(tiers) = root_dict.get(b"announce-list".as_slice()).and_then(Value::as_list) {
            for tier in tiers {
                for announce in tier.as_list().unwrap_or_default() {
                    if let Some(url) = announce.as_text() {
                        if !announce_list.contains(&url) {
                            announce_list.push(url);
                        }
                    }
                }
            }
        }
        if let Some(announce) = root_dict.get(b"announce".as_slice()).and_then(|v| v.as_text()) {
            if !announce_list.contains(&announce) {
                announce_list.push(announce);
            }
        }

        let name = info_dict
            .get(b"name".as_slice())
            .and_then(|v| v.as_text())
            .ok_or_else(|| anyhow!("torrent has no name"))?;

        let mut url_list = Vec::new();
        if let Some(urls) = root_dict.get(b"url-list".as_slice()).and_then(Value::as_list) {
            for url in urls {
                if let Some(url) = url.as_text() {
                    url_list.push(url);
                }
            }
        }

        let comment = root_dict.get(b"comment".as_slice()).and_then(|v| v.as_text());
        let created_by = root_dict.get(b"created by".as_slice()).and_then(|v| v.as_text());
        let creation_date = root_dict.get(b"creation date".as_slice()).and_then(Value::as_int);

        let piece_length = info_dict
            .get(b"piece length".as_slice())
            .and_then(Value::as_int)
            .filter(|&len| len > 0)
            .ok_or_else(|| anyhow!("torrent has no valid piece length"))?
            as u64;

        let pieces_blob = info_dict
            .get(b"pieces".as_slice())
            .and_then(Value::as_bytes)
            .ok_or_else(|| anyhow!("torrent has no pieces"))?;
        if pieces_blob.len() % SHA1_HASH_SIZE != 0 {
            return Err(anyhow!("pieces blob is not a multiple of 20 bytes"));
        }
        let pieces: Vec<[u8; 20]> = pieces_blob
            .chunks_exact(SHA1_HASH_SIZE)
            .map(|chunk| chunk.try_into().expect("chunk is 20 bytes"))
            .collect();

        // Multi-file torrents list their files; single-file mode is
        // normalized into a one-element list named after the torrent.
        let mut files = Vec::new();
        let mut total_length: u64 = 0;
        if let Some(file_list) = info_dict.get(b"files".as_slice()).and_then(Value::as_list) {
            for entry in file_list {
                let file_dict = entry
                    .as_dict()
                    .ok_or_else(|| anyhow!("file entry is not a dictionary"))?;
                let length = file_dict
                    .get(b"length".as_slice())
                    .and_then(Value::as_int)
                    .filter(|&len| len >= 0)
                    .ok_or_else(|| anyhow!("file entry has no valid length"))?
                    as u64;
                let components = file_dict
                    .get(b"path".as_slice())
                    .and_then(Value::as_list)
                    .ok_or_else(|| anyhow!("file entry has no path"))?;
                let path = components
                    .iter()
                    .filter_map(|component| component.as_text())
                    .collect::<Vec<_>>()
                    .join("/");
                total_length += length;
                files.push(FileEntry {
                    path,
                    length,
                    first_piece: 0,
                    last_piece: 0,
                });
            }
        } else {
            total_length = info_dict
                .get(b"length".as_slice())
                .and_then(Value::as_int)
                .filter(|&len| len >= 0)
                .ok_or_else(|| anyhow!("torrent has neither files nor length"))?
                as u64;
            files.push(FileEntry {
                path: name.clone(),
                length: total_length,
                first_piece: 0,
                last_piece: 0,
            });
        }

        // Each piece covers piece_length bytes except the last
        let expected_pieces = total_length.div_ceil(piece_length) as usize;
        if pieces.len() != expected_pieces {
            return Err(anyhow!(
                "torrent declares {} pieces but lengths require {}",
                pieces.len(),
                expected_pieces
            ));
        }

        // Piece index ranges from cumulative file offsets; pieces may span
        // file boundaries.
        let mut offset: u64 = 0;
        for file in &mut files {
            let end = offset + file.length;
            file.first_piece = (offset / piece_length) as usize;
            file.last_piece = if file.length == 0 {
                file.first_piece
            } else {
                ((end - 1) / piece_length) as usize
            };
            offset = end;
        }

        let is_private = info_dict
            .get(b"private".as_slice())
            .and_then(Value::as_int)
            .map(|flag| flag == 1)
            .unwrap_or(false);

        let span = bencode::info_span(content)?
            .ok_or_else(|| anyhow!("torrent has no info dictionary"))?;
        let mut hasher = Sha1::new();
        hasher.update(&content[span]);
        let info_hash = hasher.finish();

        Ok(Metainfo {
            announce_list,
            name,
            url_list,
            comment,
            created_by,
            creation_date,
            files,
            piece_length,
            pieces,
            info_hash,
            total_length,
            is_private,
        })
    }

    /// Returns the info-hash as a lowercase hex string.
    pub fn info_hash_hex(&self) -> String {
        to_hex(&self.info_hash)
    }

    /// Number of pieces in the torrent.
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Byte length of piece `index`; only the last piece may be shorter.
    pub fn piece_len(&self, index: usize) -> u64 {
        let begin = index as u64 * self.piece_length;
        let end = (begin + self.piece_length).min(self.total_length);
        end - begin
    }

    /// Offset of piece `index` within the concatenated file content.
    pub fn piece_offset(&self, index: usize) -> u64 {
        index as u64 * self.piece_length
    }
}

impl fmt::Display for Metainfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Name: {}", self.name)?;
        writeln!(f, "  InfoHash: {}", self.info_hash_hex())?;
        writeln!(f, "  Length: {}", format_bytes(self.total_length))?;
        writeln!(f, "  AnnounceList:")?;
        for announce in &self.announce_list {
            writeln!(f, "     {announce}")?;
        }
        writeln!(f, "  FileList:")?;
        for file in &self.files {
            writeln!(f, "     {}({})", file.path, format_bytes(file.length))?;
        }
        write!(f, "  PieceLength: {}", format_bytes(self.piece_length))
    }
}

/// Encodes bytes as lowercase hex.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Formats a byte count with a binary unit suffix.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const TB: u64 = 1024 * GB;

    match bytes {
        _ if bytes >= TB => format!("{:.2} TB", bytes as f64 / TB as f64),
        _ if bytes >= GB => format!("{:.2} GB", bytes as f64 / GB as f64),
        _ if bytes >= MB => format!("{:.2} MB", bytes as f64 / MB as f64),
        _ if bytes >= KB => format!("{:.2} KB", bytes as f64 / KB as f64),
        _ => format!("{bytes} B"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal single-file torrent around the given info payload.
    fn torrent_with_info(info: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"d8:announce16:http://tracker/a4:info");
        out.extend_from_slice(info);
        out.push(b'e');
        out
    }

    fn single_file_info(name: &str, piece_length: u64, length: u64, pieces: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("d6:lengthi{length}e4:name").as_bytes());
        out.extend_from_slice(format!("{}:{}", name.len(), name).as_bytes());
        out.extend_from_slice(format!("12:piece lengthi{piece_length}e6:pieces").as_bytes());
        out.extend_from_slice(format!("{}:", pieces.len()).as_bytes());
        out.extend_from_slice(pieces);
        out.push(b'e');
        out
    }

    #[test]
    fn info_hash_covers_raw_info_bytes() {
        // Keys deliberately out of canonical order: the hash must cover the
        // bytes as written, not a re-encoding.
        let mut info = Vec::new();
        info.extend_from_slice(b"d4:name5:hello12:piece lengthi16384e6:pieces20:");
        info.extend_from_slice(&[0xabu8; 20]);
        info.extend_from_slice(b"6:lengthi16384ee");
        let content = torrent_with_info(&info);

        let metainfo = Metainfo::from_bytes(&content).unwrap();

        let mut hasher = Sha1::new();
        hasher.update(&info);
        assert_eq!(metainfo.info_hash, hasher.finish());
        assert_eq!(metainfo.name, "hello");
        assert_eq!(metainfo.piece_length, 16384);
        assert_eq!(metainfo.total_length, 16384);
    }

    #[test]
    fn single_file_mode_is_normalized() {
        let info = single_file_info("hello.txt", 16384, 16384, &[0u8; 20]);
        let metainfo = Metainfo::from_bytes(&torrent_with_info(&info)).unwrap();

        assert_eq!(metainfo.files.len(), 1);
        assert_eq!(metainfo.files[0].path, "hello.txt");
        assert_eq!(metainfo.files[0].length, 16384);
        assert_eq!(metainfo.announce_list, vec!["http://tracker/a".to_string()]);
    }

    #[test]
    fn piece_lengths_sum_to_total() {
        // total 10, piece length 4: pieces of 4, 4, 2
        let info = single_file_info("data", 4, 10, &[0u8; 60]);
        let metainfo = Metainfo::from_bytes(&torrent_with_info(&info)).unwrap();

        assert_eq!(metainfo.num_pieces(), 3);
        assert_eq!(metainfo.piece_len(0), 4);
        assert_eq!(metainfo.piece_len(1), 4);
        assert_eq!(metainfo.piece_len(2), 2);
        let sum: u64 = (0..metainfo.num_pieces()).map(|i| metainfo.piece_len(i)).sum();
        assert_eq!(sum, metainfo.total_length);
    }

    #[test]
    fn piece_count_mismatch_is_rejected() {
        // total 10 over piece length 4 requires 3 hashes, only 2 given
        let info = single_file_info("data", 4, 10, &[0u8; 40]);
        assert!(Metainfo::from_bytes(&torrent_with_info(&info)).is_err());
    }

    #[test]
    fn multi_file_piece_ranges() {
        // files a(3) and b(5) over piece length 4: piece 0 spans both files
        let mut info = Vec::new();
        info.extend_from_slice(b"d5:filesl");
        info.extend_from_slice(b"d6:lengthi3e4:pathl1:aee");
        info.extend_from_slice(b"d6:lengthi5e4:pathl1:bee");
        info.extend_from_slice(b"e4:name4:data12:piece lengthi4e6:pieces40:");
        info.extend_from_slice(&[0u8; 40]);
        info.push(b'e');
        let metainfo = Metainfo::from_bytes(&torrent_with_info(&info)).unwrap();

        assert_eq!(metainfo.total_length, 8);
        assert_eq!(metainfo.files[0].path, "a");
        assert_eq!(metainfo.files[0].first_piece, 0);
        assert_eq!(metainfo.files[0].last_piece, 0);
        assert_eq!(metainfo.files[1].path, "b");
        assert_eq!(metainfo.files[1].first_piece, 0);
        assert_eq!(metainfo.files[1].last_piece, 1);
    }

    #[test]
    fn announce_list_deduplicates() {
        let mut content = Vec::new();
        content.extend_from_slice(
            b"d8:announce12:http://one/a13:announce-listll12:http://one/ael12:http://two/aee4:info",
        );
        content.extend_from_slice(&single_file_info("x", 4, 4, &[0u8; 20]));
        content.push(b'e');
        let metainfo = Metainfo::from_bytes(&content).unwrap();

        assert_eq!(
            metainfo.announce_list,
            vec!["http://one/a".to_string(), "http://two/a".to_string()]
        );
    }
}
