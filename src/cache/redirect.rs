//! Replay of cached redirects.

use super::config::CacheConfig;
use super::entry::{CacheEntry, HeaderSet};

/// Status used when a cached redirect carries a code outside 300-307.
const FALLBACK_STATUS: u16 = 302;

/// Canonical reason phrase of a 3xx status this cache knows how to replay.
pub fn reason_phrase(status: u16) -> Option<&'static str> {
    let reason = match status {
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        306 => "Reserved",
        307 => "Temporary Redirect",
        _ => return None,
    };
    Some(reason)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectResponse {
    pub status: u16,
    pub reason: &'static str,
    pub location: String,
    /// Always-sent headers only; stored entry headers are not replayed.
    pub headers: HeaderSet,
}

/// Short-circuit a hit into a redirect when the entry recorded one.
pub fn shortcut(entry: &CacheEntry, config: &CacheConfig) -> Option<RedirectResponse> {
    if !config.cache_redirects {
        return None;
    }
    let (status, location) = entry.redirect()?;

    let (status, reason) = match reason_phrase(status) {
        Some(reason) => (status, reason),
        None => (FALLBACK_STATUS, "Found"),
    };

    let mut headers = HeaderSet::from(&config.always_send_headers);
    headers.set("location", location);

    Some(RedirectResponse {
        status,
        reason,
        location: location.to_string(),
        headers,
    })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn redirect_entry(status: u16) -> CacheEntry {
        CacheEntry {
            body: Bytes::new(),
            created_at: 0,
            headers: HeaderSet::new(),
            generation_ms: 1,
            status,
            status_line: None,
            redirect_status: Some(status),
            redirect_location: Some("/new".to_string()),
            content_version: 0,
            max_age_seconds: 600,
            hard_expiry_at: 750,
        }
    }

    fn redirect_config() -> CacheConfig {
        CacheConfig {
            cache_redirects: true,
            ..Default::default()
        }
    }

    #[test]
    fn replays_permanent_redirect() {
        let redirect = shortcut(&redirect_entry(301), &redirect_config()).expect("redirect");
        assert_eq!(redirect.status, 301);
        assert_eq!(redirect.reason, "Moved Permanently");
        assert_eq!(redirect.headers.first("location"), Some("/new"));
    }

    #[test]
    fn unknown_status_falls_back_to_found() {
        let redirect = shortcut(&redirect_entry(308), &redirect_config()).expect("redirect");
        assert_eq!(redirect.status, 302);
        assert_eq!(redirect.reason, "Found");
    }

    #[test]
    fn disabled_redirect_caching_skips_shortcut() {
        assert!(shortcut(&redirect_entry(301), &CacheConfig::default()).is_none());
    }

    #[test]
    fn always_send_headers_are_included() {
        let mut config = redirect_config();
        config
            .always_send_headers
            .insert("X-Served-By".to_string(), vec!["edge-1".to_string()]);

        let redirect = shortcut(&redirect_entry(307), &config).expect("redirect");
        assert_eq!(redirect.headers.first("x-served-by"), Some("edge-1"));
        assert_eq!(redirect.reason, "Temporary Redirect");
    }
}
