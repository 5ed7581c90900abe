//! # Bencode Codec
//!
//! This module implements the bencode serialization format used by torrent
//! files and HTTP tracker responses.
//!
//! ## Grammar
//!
//! Bencode has exactly four kinds of values:
//!
//! - **Byte string**: `<length>:<bytes>` (e.g. `4:spam`). Contents are raw
//!   bytes and are never assumed to be UTF-8.
//! - **Integer**: `i<digits>e` (e.g. `i42e`, `i-42e`). Leading zeros and
//!   `-0` are rejected.
//! - **List**: `l<values>e`
//! - **Dictionary**: `d<(string, value)*>e`. Keys are byte strings; when
//!   re-encoded they are emitted in ascending lexicographic byte order.
//!
//! ## Info dictionary hashing
//!
//! A torrent is identified by the SHA-1 of the `info` dictionary exactly as
//! it appears in the source file. Re-encoding a decoded tree is not a fixed
//! point for non-canonical inputs, so [`info_span`] locates the raw byte
//! range of the `info` value for the caller to hash directly.

use std::collections::BTreeMap;
use std::ops::Range;

use anyhow::{anyhow, Result};

/// A decoded bencode value.
///
/// Dictionaries use a `BTreeMap` keyed by raw bytes, so iteration (and thus
/// encoding) visits keys in ascending lexicographic byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Integer(i64),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Returns the raw bytes if this value is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the byte string decoded as UTF-8, replacing invalid sequences.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    /// Returns the integer value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(int) => Some(*int),
            _ => None,
        }
    }

    /// Returns the list items.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    /// Returns the dictionary entries.
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(dict) => Some(dict),
            _ => None,
        }
    }
}

/// Decodes exactly one bencode value from the front of `content`.
///
/// Returns the value and the number of bytes consumed. Trailing bytes are
/// the caller's responsibility.
///
/// # Errors
///
/// Returns an error on malformed length prefixes, unterminated containers,
/// invalid integers (including `-0` and leading zeros), non-string
/// dictionary keys, or end of input in the middle of a value. All errors
/// carry the byte offset where decoding failed.
pub fn decode(content: &[u8]) -> Result<(Value, usize)> {
    let mut pos = 0;
    let value = decode_value(content, &mut pos)?;
    Ok((value, pos))
}

fn decode_value(content: &[u8], pos: &mut usize) -> Result<Value> {
    match content.get(*pos).copied() {
        Some(b'i') => decode_integer(content, pos),
        Some(b'l') => decode_list(content, pos),
        Some(b'd') => decode_dict(content, pos),
        Some(b'0'..=b'9') => decode_bytes(content, pos),
        Some(byte) => Err(anyhow!("invalid value prefix {byte:#04x} at byte {pos}")),
        None => Err(anyhow!("unexpected end of input at byte {pos}")),
    }
}

fn decode_integer(content: &[u8], pos: &mut usize) -> Result<Value> {
    let start = *pos;
    *pos += 1; // skip 'i'

    let end = content[*pos..]
        .iter()
        .position(|&byte| byte == b'e')
        .map(|offset| *pos + offset)
        .ok_or_else(|| anyhow!("unterminated integer at byte {start}"))?;

    let body = &content[*pos..end];
    let digits = match body.split_first() {
        Some((&b'-', rest)) => {
            // "-0" and "-" are not valid integers
            if rest.is_empty() || rest == b"0" {
                return Err(anyhow!("invalid integer at byte {start}"));
            }
            rest
        }
        Some(_) => body,
        None => return Err(anyhow!("empty integer at byte {start}")),
    };
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(anyhow!("integer with leading zero at byte {start}"));
    }
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(anyhow!("invalid integer at byte {start}"));
    }

    let text = std::str::from_utf8(body).expect("ascii digits");
    let int: i64 = text
        .parse()
        .map_err(|_| anyhow!("integer out of range at byte {start}"))?;

    *pos = end + 1;
    Ok(Value::Integer(int))
}

fn decode_bytes(content: &[u8], pos: &mut usize) -> Result<Value> {
    let start = *pos;

    let colon = content[*pos..]
        .iter()
        .position(|&byte| byte == b':')
        .map(|offset| *pos + offset)
        .ok_or_else(|| anyhow!("unterminated string length at byte {start}"))?;

    let prefix = std::str::from_utf8(&content[*pos..colon])
        .map_err(|_| anyhow!("invalid string length at byte {start}"))?;
    let length: usize = prefix
        .parse()
        .map_err(|_| anyhow!("invalid string length at byte {start}"))?;

    let data_start = colon + 1;
    let data_end = data_start
        .checked_add(length)
        .filter(|&end| end <= content.len())
        .ok_or_else(|| anyhow!("string truncated at byte {start}"))?;

    *pos = data_end;
    Ok(Value::Bytes(content[data_start..data_end].to_vec()))
}

fn decode_list(content: &[u8], pos: &mut usize) -> Result<Value> {
    let start = *pos;
    *pos += 1; // skip 'l'

    let mut list = Vec::new();
    loop {
        match content.get(*pos).copied() {
            Some(b'e') => {
                *pos += 1;
                return Ok(Value::List(list));
            }
            Some(_) => list.push(decode_value(content, pos)?),
            None => return Err(anyhow!("unterminated list at byte {start}")),
        }
    }
}

fn decode_dict(content: &[u8], pos: &mut usize) -> Result<Value> {
    let start = *pos;
    *pos += 1; // skip 'd'

    let mut dict = BTreeMap::new();
    loop {
        match content.get(*pos).copied() {
            Some(b'e') => {
                *pos += 1;
                return Ok(Value::Dict(dict));
            }
            Some(_) => {
                let key_pos = *pos;
                let key = match decode_value(content, pos)? {
                    Value::Bytes(key) => key,
                    _ => return Err(anyhow!("non-string dictionary key at byte {key_pos}")),
                };
                let value = decode_value(content, pos)?;
                dict.insert(key, value);
            }
            None => return Err(anyhow!("unterminated dictionary at byte {start}")),
        }
    }
}

/// Encodes a value back into bencode bytes.
///
/// Encoding is deterministic: dictionary keys are emitted in ascending
/// lexicographic byte order and integers carry no redundant sign or leading
/// zeros, so `encode(decode(bytes)) == bytes` for canonical input.
#[allow(dead_code)]
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Bytes(bytes) => {
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(bytes);
        }
        Value::Integer(int) => {
            out.push(b'i');
            out.extend_from_slice(int.to_string().as_bytes());
            out.push(b'e');
        }
        Value::List(list) => {
            out.push(b'l');
            for item in list {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(dict) => {
            out.push(b'd');
            for (key, item) in dict {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

/// Locates the raw byte range of the `info` value in a top-level dictionary.
///
/// Returns `None` when the dictionary has no `info` key. The range covers
/// the value exactly as encoded in `content`, suitable for hashing without
/// re-encoding.
pub fn info_span(content: &[u8]) -> Result<Option<Range<usize>>> {
    let mut pos = 0;
    if content.first() != Some(&b'd') {
        return Err(anyhow!("top-level value is not a dictionary"));
    }
    pos += 1;

    loop {
        match content.get(pos).copied() {
            Some(b'e') => return Ok(None),
            Some(_) => {
                let key_pos = pos;
                let key = match decode_value(content, &mut pos)? {
                    Value::Bytes(key) => key,
                    _ => return Err(anyhow!("non-string dictionary key at byte {key_pos}")),
                };
                let value_start = pos;
                decode_value(content, &mut pos)?;
                if key == b"info" {
                    return Ok(Some(value_start..pos));
                }
            }
            None => return Err(anyhow!("unterminated dictionary at byte 0")),
        }
    }
}
