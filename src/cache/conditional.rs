//! Conditional request evaluation for cache hits.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::context::RequestContext;
use super::entry::{CacheEntry, HeaderSet};

/// How a cache hit should be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conditional {
    NotModified,
    Serve,
}

/// Compare the request's validators against a cached entry.
///
/// `If-None-Match` must equal the stored `ETag` exactly. Otherwise, when
/// validator headers are enabled, an `If-Modified-Since` at or after the
/// entry's `Last-Modified` (or creation time) answers 304.
pub fn evaluate(entry: &CacheEntry, ctx: &RequestContext, validators: bool) -> Conditional {
    if let (Some(client), Some(etag)) = (ctx.if_none_match(), entry.headers.first("etag")) {
        if client == etag {
            return Conditional::NotModified;
        }
    }

    if !validators {
        return Conditional::Serve;
    }

    let Some(client_time) = ctx.if_modified_since().and_then(parse_http_date) else {
        return Conditional::Serve;
    };
    let cache_time = entry
        .headers
        .first("last-modified")
        .and_then(parse_http_date)
        .unwrap_or(entry.created_at);

    if client_time >= cache_time {
        Conditional::NotModified
    } else {
        Conditional::Serve
    }
}

/// `Last-Modified` and `Cache-Control` for a hit, unless the origin set them.
pub fn freshness_headers(entry: &CacheEntry, now: i64) -> HeaderSet {
    let mut headers = HeaderSet::new();
    if !entry.headers.contains("last-modified") {
        headers.set("last-modified", http_date(entry.created_at));
    }
    if !entry.headers.contains("cache-control") {
        let remaining = entry.remaining(now).max(0);
        headers.set(
            "cache-control",
            format!("max-age={remaining}, must-revalidate"),
        );
    }
    headers
}

/// Format unix seconds as an IMF-fixdate.
pub fn http_date(unix_seconds: i64) -> String {
    let at = UNIX_EPOCH + Duration::from_secs(unix_seconds.max(0) as u64);
    httpdate::fmt_http_date(at)
}

fn parse_http_date(value: &str) -> Option<i64> {
    let at = httpdate::parse_http_date(value.trim()).ok()?;
    let seconds = at.duration_since(SystemTime::UNIX_EPOCH).ok()?.as_secs();
    i64::try_from(seconds).ok()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    // 2001-09-09T01:46:40Z
    const CREATED: i64 = 1_000_000_000;

    fn entry_with(headers: &[(&str, &str)]) -> CacheEntry {
        CacheEntry {
            body: Bytes::from_static(b"<p>cached</p>"),
            created_at: CREATED,
            headers: headers.iter().copied().collect(),
            generation_ms: 5,
            status: 200,
            status_line: None,
            redirect_status: None,
            redirect_location: None,
            content_version: 0,
            max_age_seconds: 600,
            hard_expiry_at: CREATED + 750,
        }
    }

    #[test]
    fn matching_etag_is_not_modified() {
        let entry = entry_with(&[("ETag", "\"abc\"")]);
        let ctx = RequestContext::get("example.com", "/").with_header("If-None-Match", "\"abc\"");
        assert_eq!(evaluate(&entry, &ctx, false), Conditional::NotModified);
    }

    #[test]
    fn etag_comparison_is_exact() {
        let entry = entry_with(&[("ETag", "\"abc\"")]);
        let ctx = RequestContext::get("example.com", "/").with_header("If-None-Match", "W/\"abc\"");
        assert_eq!(evaluate(&entry, &ctx, true), Conditional::Serve);
    }

    #[test]
    fn if_modified_since_falls_back_to_creation_time() {
        let entry = entry_with(&[]);
        let same = RequestContext::get("example.com", "/")
            .with_header("If-Modified-Since", &http_date(CREATED));
        let earlier = RequestContext::get("example.com", "/")
            .with_header("If-Modified-Since", &http_date(CREATED - 60));

        assert_eq!(evaluate(&entry, &same, true), Conditional::NotModified);
        assert_eq!(evaluate(&entry, &earlier, true), Conditional::Serve);
        assert_eq!(evaluate(&entry, &same, false), Conditional::Serve);
    }

    #[test]
    fn stored_last_modified_wins_over_creation_time() {
        let entry = entry_with(&[("Last-Modified", http_date(CREATED + 3_600).as_str())]);
        let ctx = RequestContext::get("example.com", "/")
            .with_header("If-Modified-Since", &http_date(CREATED + 60));
        assert_eq!(evaluate(&entry, &ctx, true), Conditional::Serve);
    }

    #[test]
    fn unparseable_if_modified_since_serves() {
        let entry = entry_with(&[]);
        let ctx = RequestContext::get("example.com", "/").with_header("If-Modified-Since", "soon");
        assert_eq!(evaluate(&entry, &ctx, true), Conditional::Serve);
    }

    #[test]
    fn freshness_headers_respect_origin_values() {
        let bare = freshness_headers(&entry_with(&[]), CREATED + 100);
        assert_eq!(bare.first("last-modified"), Some("Sun, 09 Sep 2001 01:46:40 GMT"));
        assert_eq!(bare.first("cache-control"), Some("max-age=500, must-revalidate"));

        let origin = freshness_headers(
            &entry_with(&[("Cache-Control", "public, max-age=60")]),
            CREATED + 100,
        );
        assert!(!origin.contains("cache-control"));
        assert!(origin.contains("last-modified"));
    }
}
