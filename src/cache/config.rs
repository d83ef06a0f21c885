//! Page cache configuration.
//!
//! Controls admission sampling, expiry, redirect caching and header handling
//! via the `[cache]` section of `pagefront.toml`.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::store::Namespace;

// Default values for cache configuration
const DEFAULT_MAX_AGE_SECONDS: u64 = 600;
const DEFAULT_MIN_HITS: u32 = 2;
const DEFAULT_WINDOW_SECONDS: u64 = 120;
const DEFAULT_STORE_NAMESPACE: &str = "page_cache";
const DEFAULT_CONTENT_ID_PARAM: &str = "p";
const DEFAULT_GENLOCK_TTL_SECONDS: u64 = 10;
const DEFAULT_EXPIRY_SLACK_SECONDS: u64 = 30;
const DEFAULT_VARY_TTL_SLACK_SECONDS: u64 = 10;
const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Longest direct-serve lifetime an entry may get, whatever the origin asks for.
pub const MAX_AGE_CEILING_SECONDS: u64 = u32::MAX as u64;

/// Page cache configuration from `pagefront.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum age of a cached page in seconds. Zero disables caching.
    pub max_age_seconds: u64,
    /// False keeps entries on the local store node only.
    pub send_to_remote_store: bool,
    /// Cache a page only after it was requested this many times...
    pub min_hits: u32,
    /// ...within this many seconds. Zero caches on the first miss.
    pub window_seconds: u64,
    /// Store namespace. Changing it simulates a flush.
    pub store_namespace: String,
    /// Cache and replay origin redirects.
    pub cache_redirects: bool,
    /// Response headers that are never written into an entry (lowercase).
    pub never_persist_headers: Vec<String>,
    /// Insert timing comments into HTML bodies.
    pub debug_annotations: bool,
    /// Emit `Last-Modified`/`Cache-Control` and honour `If-Modified-Since`.
    pub send_validator_headers: bool,
    /// Cookies that never cause a bypass.
    pub exempt_cookies: Vec<String>,
    /// Cookies that always cause a bypass.
    pub bypass_cookies: Vec<String>,
    /// Cookie name prefixes that cause a bypass.
    pub bypass_cookie_prefixes: Vec<String>,
    /// Headers sent with every cached response; they win over stored ones.
    pub always_send_headers: BTreeMap<String, Vec<String>>,
    /// The one query parameter that is part of a URL's content identity.
    pub content_id_param: String,
    pub genlock_ttl_seconds: u64,
    /// Extra lifetime past `max_age + window` before the store drops an entry.
    pub expiry_slack_seconds: u64,
    pub vary_ttl_slack_seconds: u64,
    /// Largest response body buffered for capture.
    pub max_body_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_seconds: DEFAULT_MAX_AGE_SECONDS,
            send_to_remote_store: true,
            min_hits: DEFAULT_MIN_HITS,
            window_seconds: DEFAULT_WINDOW_SECONDS,
            store_namespace: DEFAULT_STORE_NAMESPACE.to_string(),
            cache_redirects: false,
            never_persist_headers: vec!["transfer-encoding".to_string()],
            debug_annotations: false,
            send_validator_headers: true,
            exempt_cookies: Vec::new(),
            bypass_cookies: Vec::new(),
            bypass_cookie_prefixes: Vec::new(),
            always_send_headers: BTreeMap::new(),
            content_id_param: DEFAULT_CONTENT_ID_PARAM.to_string(),
            genlock_ttl_seconds: DEFAULT_GENLOCK_TTL_SECONDS,
            expiry_slack_seconds: DEFAULT_EXPIRY_SLACK_SECONDS,
            vary_ttl_slack_seconds: DEFAULT_VARY_TTL_SLACK_SECONDS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            max_age_seconds: settings.max_age_seconds,
            send_to_remote_store: settings.send_to_remote_store,
            min_hits: settings.min_hits,
            window_seconds: settings.window_seconds,
            store_namespace: settings.store_namespace.clone(),
            cache_redirects: settings.cache_redirects,
            never_persist_headers: settings
                .never_persist_headers
                .iter()
                .map(|name| name.to_ascii_lowercase())
                .collect(),
            debug_annotations: settings.debug_annotations,
            send_validator_headers: settings.send_validator_headers,
            exempt_cookies: settings.exempt_cookies.clone(),
            bypass_cookies: settings.bypass_cookies.clone(),
            bypass_cookie_prefixes: settings.bypass_cookie_prefixes.clone(),
            always_send_headers: settings.always_send_headers.clone(),
            content_id_param: settings.content_id_param.clone(),
            genlock_ttl_seconds: settings.genlock_ttl_seconds,
            expiry_slack_seconds: settings.expiry_slack_seconds,
            vary_ttl_slack_seconds: settings.vary_ttl_slack_seconds,
            max_body_bytes: settings.max_body_bytes,
        }
    }
}

impl CacheConfig {
    /// Returns true unless `max_age_seconds` is zero.
    pub fn is_enabled(&self) -> bool {
        self.max_age_seconds >= 1
    }

    /// Returns true when pages must earn admission through request counting.
    pub fn sampling_enabled(&self) -> bool {
        self.window_seconds >= 1 && self.min_hits >= 2
    }

    /// Store namespace handed to the store collaborator.
    pub fn namespace(&self) -> Namespace {
        Namespace {
            name: self.store_namespace.clone(),
            local_only: !self.send_to_remote_store,
        }
    }

    /// Direct-serve lifetime of a new entry: the origin's `max-age` if it
    /// sent one, else the configured default, capped at
    /// [`MAX_AGE_CEILING_SECONDS`].
    pub fn effective_max_age(&self, origin_max_age: Option<u64>) -> u64 {
        origin_max_age
            .unwrap_or(self.max_age_seconds)
            .min(MAX_AGE_CEILING_SECONDS)
    }

    /// Seconds an entry written now stays in the store.
    pub fn entry_ttl_seconds(&self, max_age_seconds: u64) -> u64 {
        max_age_seconds
            .saturating_add(self.window_seconds)
            .saturating_add(self.expiry_slack_seconds)
    }

    /// Returns true if `name` must be stripped before an entry is written.
    pub fn never_persists(&self, name: &str) -> bool {
        self.never_persist_headers
            .iter()
            .any(|header| header.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.max_age_seconds, 600);
        assert!(config.send_to_remote_store);
        assert_eq!(config.min_hits, 2);
        assert_eq!(config.window_seconds, 120);
        assert_eq!(config.store_namespace, "page_cache");
        assert!(!config.cache_redirects);
        assert_eq!(config.never_persist_headers, vec!["transfer-encoding"]);
        assert!(config.send_validator_headers);
        assert_eq!(config.genlock_ttl_seconds, 10);
        assert_eq!(config.expiry_slack_seconds, 30);
    }

    #[test]
    fn zero_max_age_disables_cache() {
        let config = CacheConfig {
            max_age_seconds: 0,
            ..Default::default()
        };
        assert!(!config.is_enabled());
    }

    #[test]
    fn sampling_needs_window_and_two_hits() {
        let base = CacheConfig::default();
        assert!(base.sampling_enabled());

        let no_window = CacheConfig {
            window_seconds: 0,
            ..Default::default()
        };
        assert!(!no_window.sampling_enabled());

        let single_hit = CacheConfig {
            min_hits: 1,
            ..Default::default()
        };
        assert!(!single_hit.sampling_enabled());
    }

    #[test]
    fn entry_ttl_overshoots_max_age() {
        let config = CacheConfig {
            window_seconds: 120,
            ..Default::default()
        };
        assert_eq!(config.entry_ttl_seconds(600), 750);
    }

    #[test]
    fn entry_ttl_saturates() {
        let config = CacheConfig::default();
        assert_eq!(config.entry_ttl_seconds(u64::MAX), u64::MAX);
    }

    #[test]
    fn origin_max_age_is_capped() {
        let config = CacheConfig::default();
        assert_eq!(config.effective_max_age(None), 600);
        assert_eq!(config.effective_max_age(Some(60)), 60);
        assert_eq!(
            config.effective_max_age(Some(u64::MAX)),
            MAX_AGE_CEILING_SECONDS
        );
    }

    #[test]
    fn local_only_namespace_when_remote_disabled() {
        let config = CacheConfig {
            send_to_remote_store: false,
            ..Default::default()
        };
        let namespace = config.namespace();
        assert_eq!(namespace.name, "page_cache");
        assert!(namespace.local_only);
    }

    #[test]
    fn never_persist_is_case_insensitive() {
        let config = CacheConfig::default();
        assert!(config.never_persists("Transfer-Encoding"));
        assert!(!config.never_persists("Content-Type"));
    }
}
