//! Cached page entries and their header sets.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Response headers keyed by lowercase name, each with one or more values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderSet(BTreeMap<String, Vec<String>>);

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, keeping earlier values for the same name.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.0
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Replace every value of `name`.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    /// Keep only the names for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.0.retain(|name, _| keep(name));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Layer `overrides` on top of this set.
    ///
    /// Names present in both keep the override values first followed by this
    /// set's values, de-duplicated. The result is emitted with the override
    /// names clobbering anything sent earlier under the same name.
    pub fn layered_under(&self, overrides: &HeaderSet) -> HeaderSet {
        let mut merged = self.clone();
        for (name, values) in &overrides.0 {
            let mut combined = values.clone();
            if let Some(existing) = self.0.get(name) {
                combined.extend(existing.iter().cloned());
            }
            let mut seen = Vec::with_capacity(combined.len());
            for value in combined {
                if !seen.contains(&value) {
                    seen.push(value);
                }
            }
            merged.0.insert(name.clone(), seen);
        }
        merged
    }
}

impl From<&BTreeMap<String, Vec<String>>> for HeaderSet {
    fn from(map: &BTreeMap<String, Vec<String>>) -> Self {
        let mut headers = HeaderSet::new();
        for (name, values) in map {
            for value in values {
                headers.append(name, value.clone());
            }
        }
        headers
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for HeaderSet {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut headers = HeaderSet::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

/// A snapshot of a generated page. Replaced wholesale on regeneration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(with = "body_codec")]
    pub body: Bytes,
    /// Unix seconds when the generating request started.
    pub created_at: i64,
    pub headers: HeaderSet,
    pub generation_ms: u64,
    pub status: u16,
    /// Full status line as produced by the origin, e.g. `HTTP/1.1 404 Not Found`.
    pub status_line: Option<String>,
    pub redirect_status: Option<u16>,
    pub redirect_location: Option<String>,
    pub content_version: i64,
    pub max_age_seconds: u64,
    pub hard_expiry_at: i64,
}

impl CacheEntry {
    /// Seconds since the entry was created.
    pub fn age(&self, now: i64) -> i64 {
        now.saturating_sub(self.created_at)
    }

    /// Unix seconds after which the entry is no longer served directly.
    pub fn expires_at(&self) -> i64 {
        self.created_at
            .saturating_add(i64::try_from(self.max_age_seconds).unwrap_or(i64::MAX))
    }

    pub fn is_fresh(&self, now: i64) -> bool {
        now <= self.expires_at()
    }

    /// Seconds of direct-serve lifetime left (may be negative).
    pub fn remaining(&self, now: i64) -> i64 {
        self.expires_at().saturating_sub(now)
    }

    /// True once `now` falls into the trailing resample window.
    pub fn in_resample_window(&self, now: i64, window_seconds: u64) -> bool {
        let window = i64::try_from(window_seconds).unwrap_or(i64::MAX);
        now >= self.expires_at().saturating_sub(window)
    }

    pub fn redirect(&self) -> Option<(u16, &str)> {
        match (self.redirect_status, self.redirect_location.as_deref()) {
            (Some(status), Some(location)) if !location.is_empty() => Some((status, location)),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Decode a stored entry. Anything malformed or incomplete reads as absent.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        serde_json::from_slice(raw).ok()
    }
}

mod body_codec {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> CacheEntry {
        let mut headers = HeaderSet::new();
        headers.append("Content-Type", "text/html; charset=utf-8");
        headers.append("ETag", "\"abc\"");
        CacheEntry {
            body: Bytes::from_static(b"<html><head></head><body>hi</body></html>"),
            created_at: 1_000,
            headers,
            generation_ms: 42,
            status: 200,
            status_line: Some("HTTP/1.1 200 OK".to_string()),
            redirect_status: None,
            redirect_location: None,
            content_version: 3,
            max_age_seconds: 600,
            hard_expiry_at: 1_750,
        }
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let entry = sample_entry();
        assert_eq!(entry.headers.first("etag"), Some("\"abc\""));
        assert!(entry.headers.contains("CONTENT-TYPE"));
    }

    #[test]
    fn encode_decode_preserves_body_and_headers() {
        let entry = sample_entry();
        let raw = entry.encode().expect("encode");
        let decoded = CacheEntry::decode(&raw).expect("decode");
        assert_eq!(decoded.body, entry.body);
        assert_eq!(decoded.headers, entry.headers);
        assert_eq!(decoded, entry);
    }

    #[test]
    fn incomplete_entries_decode_as_absent() {
        assert!(CacheEntry::decode(br#"{"body":"aGk=","created_at":1}"#).is_none());
        assert!(CacheEntry::decode(b"not json").is_none());
    }

    #[test]
    fn freshness_and_resample_window() {
        let entry = sample_entry();
        assert!(entry.is_fresh(1_600));
        assert!(!entry.is_fresh(1_601));
        assert!(!entry.in_resample_window(1_479, 120));
        assert!(entry.in_resample_window(1_480, 120));
        assert_eq!(entry.remaining(1_100), 500);
    }

    #[test]
    fn redirect_requires_status_and_location() {
        let mut entry = sample_entry();
        assert!(entry.redirect().is_none());
        entry.redirect_status = Some(301);
        assert!(entry.redirect().is_none());
        entry.redirect_location = Some("/new".to_string());
        assert_eq!(entry.redirect(), Some((301, "/new")));
    }

    #[test]
    fn overrides_win_and_values_deduplicate() {
        let mut stored = HeaderSet::new();
        stored.append("X-Frame-Options", "DENY");
        stored.append("Content-Type", "text/html");

        let mut configured = HeaderSet::new();
        configured.append("x-frame-options", "SAMEORIGIN");
        configured.append("x-frame-options", "DENY");

        let merged = stored.layered_under(&configured);
        assert_eq!(
            merged.get("x-frame-options"),
            Some(&["SAMEORIGIN".to_string(), "DENY".to_string()][..])
        );
        assert_eq!(merged.first("content-type"), Some("text/html"));
    }
}
