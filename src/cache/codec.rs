//! Binary record format for cache entries on disk.
//!
//! One file holds one entry. The record is little-endian and starts with a
//! magic tag and a format version so that foreign or outdated files are
//! rejected instead of misread.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const MAGIC: &[u8; 4] = b"ISRE";
const FORMAT_VERSION: u16 = 1;

/// A fully buffered response plus the timing metadata needed to judge its
/// freshness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub body: Bytes,
    /// Header names with their raw values; values may hold any bytes a
    /// `HeaderValue` accepts, not only visible ASCII.
    pub headers: Vec<(String, Bytes)>,
    pub status: u16,
    /// Wall-clock write time, milliseconds since the Unix epoch.
    pub cached_at_ms: u64,
    /// Seconds the entry is fresh.
    pub s_maxage: u64,
    /// Seconds after `s_maxage` during which the entry may be served stale.
    pub swr: u64,
}

impl CacheEntry {
    /// Bytes charged against the memory budget.
    pub fn byte_size(&self) -> usize {
        self.body.len()
            + self
                .headers
                .iter()
                .map(|(name, value)| name.len() + value.len())
                .sum::<usize>()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("record is truncated: needed {needed} more bytes for {field}")]
    Truncated { field: &'static str, needed: usize },
    #[error("record does not start with the cache entry magic")]
    BadMagic,
    #[error("unsupported record version {0}")]
    UnsupportedVersion(u16),
    #[error("header {field} is not valid UTF-8")]
    InvalidText { field: &'static str },
    #[error("{0} trailing bytes after record body")]
    TrailingBytes(usize),
}

/// Serialize an entry into a single self-contained record.
pub fn encode(entry: &CacheEntry) -> Bytes {
    let headers_len: usize = entry
        .headers
        .iter()
        .map(|(name, value)| 8 + name.len() + value.len())
        .sum();
    let mut buf = BytesMut::with_capacity(4 + 2 + 2 + 24 + 4 + headers_len + 8 + entry.body.len());

    buf.put_slice(MAGIC);
    buf.put_u16_le(FORMAT_VERSION);
    buf.put_u16_le(entry.status);
    buf.put_u64_le(entry.cached_at_ms);
    buf.put_u64_le(entry.s_maxage);
    buf.put_u64_le(entry.swr);

    buf.put_u32_le(entry.headers.len() as u32);
    for (name, value) in &entry.headers {
        buf.put_u32_le(name.len() as u32);
        buf.put_slice(name.as_bytes());
        buf.put_u32_le(value.len() as u32);
        buf.put_slice(value);
    }

    buf.put_u64_le(entry.body.len() as u64);
    buf.put_slice(&entry.body);

    buf.freeze()
}

/// Parse a record produced by [`encode`].
pub fn decode(mut raw: &[u8]) -> Result<CacheEntry, CodecError> {
    ensure(raw, MAGIC.len(), "magic")?;
    if &raw[..MAGIC.len()] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    raw.advance(MAGIC.len());

    ensure(raw, 2, "version")?;
    let version = raw.get_u16_le();
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    ensure(raw, 2 + 8 * 3, "metadata")?;
    let status = raw.get_u16_le();
    let cached_at_ms = raw.get_u64_le();
    let s_maxage = raw.get_u64_le();
    let swr = raw.get_u64_le();

    ensure(raw, 4, "header count")?;
    let header_count = raw.get_u32_le() as usize;
    let mut headers = Vec::with_capacity(header_count.min(64));
    for _ in 0..header_count {
        let name = read_text(&mut raw, "name")?;
        let value = Bytes::copy_from_slice(read_field(&mut raw, "value")?);
        headers.push((name, value));
    }

    ensure(raw, 8, "body length")?;
    let body_len = usize::try_from(raw.get_u64_le()).map_err(|_| CodecError::Truncated {
        field: "body",
        needed: usize::MAX,
    })?;
    ensure(raw, body_len, "body")?;
    let body = Bytes::copy_from_slice(&raw[..body_len]);
    raw.advance(body_len);

    if raw.has_remaining() {
        return Err(CodecError::TrailingBytes(raw.remaining()));
    }

    Ok(CacheEntry {
        body,
        headers,
        status,
        cached_at_ms,
        s_maxage,
        swr,
    })
}

fn ensure(raw: &[u8], len: usize, field: &'static str) -> Result<(), CodecError> {
    if raw.len() < len {
        return Err(CodecError::Truncated {
            field,
            needed: len - raw.len(),
        });
    }
    Ok(())
}

fn read_field<'a>(raw: &mut &'a [u8], field: &'static str) -> Result<&'a [u8], CodecError> {
    ensure(raw, 4, field)?;
    let len = raw.get_u32_le() as usize;
    ensure(raw, len, field)?;
    let (value, rest) = raw.split_at(len);
    *raw = rest;
    Ok(value)
}

fn read_text(raw: &mut &[u8], field: &'static str) -> Result<String, CodecError> {
    let bytes = read_field(raw, field)?;
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| CodecError::InvalidText { field })
}
