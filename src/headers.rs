//! Rate-limit header ingestion.
//!
//! Providers report window state through `x-ratelimit-*` response headers and
//! `retry-after`. This module normalizes header access (ASCII-lowercase names,
//! first value wins) and parses the provider duration formats: compound
//! duration strings like `"1m30.951s"`, bare-second values, and HTTP-dates.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

pub const LIMIT_REQUESTS: &str = "x-ratelimit-limit-requests";
pub const REMAINING_REQUESTS: &str = "x-ratelimit-remaining-requests";
pub const RESET_REQUESTS: &str = "x-ratelimit-reset-requests";
pub const LIMIT_TOKENS: &str = "x-ratelimit-limit-tokens";
pub const REMAINING_TOKENS: &str = "x-ratelimit-remaining-tokens";
pub const RESET_TOKENS: &str = "x-ratelimit-reset-tokens";
pub const RETRY_AFTER: &str = "retry-after";

/// Normalized header view: names are ASCII-lowercased and, for multi-valued
/// headers, the first value wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    map: HashMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from any iterable of name/value pairs. Repeated names keep the
    /// first value, matching array-valued header semantics.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut headers = Self::new();
        for (name, value) in pairs {
            headers.insert(name.as_ref(), value.as_ref());
        }
        headers
    }

    /// Insert a header, keeping any previously seen value for the same name.
    pub fn insert(&mut self, name: &str, value: &str) {
        self.map.entry(name.to_ascii_lowercase()).or_insert_with(|| value.trim().to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(|v| v.parse::<u64>().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}

/// Parse a compound duration: one or more `<number><unit>` segments where
/// unit is `ms`, `s`, `m`, `h`, or `d`, e.g. `"1m30.951s"` or `"500ms"`.
///
/// The whole string must be consumed; trailing garbage rejects the parse so a
/// malformed header never silently truncates.
pub fn parse_compound_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    let bytes = s.as_bytes();
    let mut idx = 0;
    let mut total_ms = 0f64;
    let mut segments = 0;

    while idx < bytes.len() {
        let number_start = idx;
        while idx < bytes.len() && (bytes[idx].is_ascii_digit() || bytes[idx] == b'.') {
            idx += 1;
        }
        let number: f64 = s[number_start..idx].parse().ok()?;

        let unit_start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_alphabetic() {
            idx += 1;
        }
        let per_unit_ms = match &s[unit_start..idx] {
            "ms" => 1.0,
            "s" => 1_000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            "d" => 86_400_000.0,
            _ => return None,
        };

        total_ms += number * per_unit_ms;
        segments += 1;
    }

    if segments == 0 || !total_ms.is_finite() || total_ms < 0.0 {
        return None;
    }
    Some(Duration::from_millis(total_ms.round() as u64))
}

/// Parse a reset header value. Only the compound grammar is accepted; a bare
/// number has no defined unit here and parses as nothing.
pub fn parse_reset(value: &str) -> Option<Duration> {
    parse_compound_duration(value)
}

/// Parse a `retry-after` value: bare seconds (integer or fractional), a
/// compound duration, or an HTTP-date. Dates in the past clamp to zero.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }

    if let Ok(seconds) = v.parse::<f64>() {
        if seconds.is_finite() && seconds >= 0.0 {
            return Some(Duration::from_millis((seconds * 1_000.0).round() as u64));
        }
        return None;
    }

    if let Some(duration) = parse_compound_duration(v) {
        return Some(duration);
    }

    let when = httpdate::parse_http_date(v).ok()?;
    // Clock skew can put the date in the past; clamp instead of failing.
    Some(when.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
}

/// Retry-after hint from a normalized header set.
pub fn retry_after_hint(headers: &Headers) -> Option<Duration> {
    headers.get(RETRY_AFTER).and_then(parse_retry_after)
}
