//! Freshness rules derived from `Cache-Control`.

use std::fmt;

use axum::http::{HeaderMap, HeaderValue, header};

use super::codec::CacheEntry;

/// Header attached to every response the handler returns.
pub const CACHE_STATUS_HEADER: &str = "x-isr-cache";

/// Which path served a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    Hit,
    Stale,
    Miss,
    /// A render ran but its result was not cacheable.
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Stale => "STALE",
            Self::Miss => "MISS",
            Self::Bypass => "BYPASS",
        }
    }

    pub fn header_value(self) -> HeaderValue {
        HeaderValue::from_static(self.as_str())
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The directives this cache acts on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
    pub stale_while_revalidate: Option<u64>,
    pub no_store: bool,
    pub no_cache: bool,
    pub private: bool,
}

impl CacheControl {
    /// Parses a `Cache-Control` value. Unknown or malformed directives are
    /// ignored.
    pub fn parse(value: &str) -> Self {
        let mut cc = Self::default();

        for directive in value.split(',') {
            let directive = directive.trim();
            let (name, arg) = match directive.split_once('=') {
                Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
                None => (directive, None),
            };
            let seconds = arg.and_then(|arg| arg.parse::<u64>().ok());

            match name.to_ascii_lowercase().as_str() {
                "max-age" => cc.max_age = seconds,
                "s-maxage" => cc.s_maxage = seconds,
                "stale-while-revalidate" => cc.stale_while_revalidate = seconds,
                "no-store" => cc.no_store = true,
                "no-cache" => cc.no_cache = true,
                "private" => cc.private = true,
                _ => {}
            }
        }

        cc
    }

    /// Combines every `Cache-Control` header line into one directive set.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let joined = headers
            .get_all(header::CACHE_CONTROL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect::<Vec<_>>()
            .join(",");
        Self::parse(&joined)
    }
}

/// Freshness windows for a cacheable response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub s_maxage: u64,
    pub swr: u64,
}

impl Freshness {
    /// Returns `Some` only when the response carries a positive `s-maxage`.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let cc = CacheControl::from_headers(headers);
        match cc.s_maxage {
            Some(s_maxage) if s_maxage > 0 => Some(Self {
                s_maxage,
                swr: cc.stale_while_revalidate.unwrap_or(0),
            }),
            _ => None,
        }
    }
}

/// Rewrites `Cache-Control` on an image response that only declares
/// `max-age`, adding a matching `s-maxage` and `stale-while-revalidate`.
///
/// Returns true when the header was changed.
pub fn apply_image_override(headers: &mut HeaderMap, default_swr: u64) -> bool {
    let cc = CacheControl::from_headers(headers);
    let max_age = match (cc.max_age, cc.s_maxage) {
        (Some(max_age), None) => max_age,
        _ => return false,
    };

    let original = headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ");
    let rewritten = format!("{original}, s-maxage={max_age}, stale-while-revalidate={default_swr}");

    match HeaderValue::from_str(&rewritten) {
        Ok(value) => {
            headers.insert(header::CACHE_CONTROL, value);
            true
        }
        Err(_) => false,
    }
}

/// Where an entry sits in its lifetime at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Fresh,
    Stale,
    Expired,
}

impl CacheState {
    pub fn classify(entry: &CacheEntry, now_ms: u64) -> Self {
        let age_ms = now_ms.saturating_sub(entry.cached_at_ms);
        let fresh_ms = entry.s_maxage.saturating_mul(1_000);
        let usable_ms = fresh_ms.saturating_add(entry.swr.saturating_mul(1_000));

        if age_ms < fresh_ms {
            Self::Fresh
        } else if age_ms < usable_ms {
            Self::Stale
        } else {
            Self::Expired
        }
    }
}
