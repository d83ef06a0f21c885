//! Turning a freshly generated response into a cache entry.

use bytes::Bytes;
use tracing::debug;

use super::config::CacheConfig;
use super::entry::{CacheEntry, HeaderSet};
use super::keys::{CacheKey, UrlKey};
use super::store::EntryStore;
use super::vary::VaryDimensionSet;

/// What the application produced for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedResponse {
    pub status: u16,
    /// Status line as the origin produced it, kept verbatim in the entry.
    pub status_line: Option<String>,
    pub headers: HeaderSet,
    pub body: Bytes,
    /// Redirect target if the application issued one.
    pub redirect: Option<(u16, String)>,
}

impl GeneratedResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            status_line: None,
            headers: HeaderSet::new(),
            body: body.into(),
            redirect: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_redirect(mut self, status: u16, location: impl Into<String>) -> Self {
        let location = location.into();
        self.headers.set("location", location.clone());
        self.status = status;
        self.redirect = Some((status, location));
        self
    }

    fn has_blank_body(&self) -> bool {
        self.body.iter().all(u8::is_ascii_whitespace)
    }
}

/// Why a generated response was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Cancelled,
    EmptyBody,
    ServerError,
    SetCookie,
    Oversized,
    BodyError,
    StoreWrite,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Cancelled => "cancelled",
            SkipReason::EmptyBody => "empty_body",
            SkipReason::ServerError => "server_error",
            SkipReason::SetCookie => "set_cookie",
            SkipReason::Oversized => "oversized",
            SkipReason::BodyError => "body_error",
            SkipReason::StoreWrite => "store_write",
        }
    }
}

/// Identity and timing of the request whose output is being captured.
#[derive(Debug, Clone, Copy)]
pub struct CaptureTarget<'a> {
    pub key: &'a CacheKey,
    pub url_key: &'a UrlKey,
    pub dimensions: &'a VaryDimensionSet,
    /// Unix seconds when the request started; becomes `created_at`.
    pub started_at: i64,
    pub generation_ms: u64,
    pub content_version: i64,
}

pub struct ResponseCapture<'a> {
    config: &'a CacheConfig,
    store: &'a EntryStore,
}

impl<'a> ResponseCapture<'a> {
    pub fn new(config: &'a CacheConfig, store: &'a EntryStore) -> Self {
        Self { config, store }
    }

    /// Snapshot `generated` and write it. Nothing is written on rejection.
    pub async fn capture(
        &self,
        target: CaptureTarget<'_>,
        generated: &GeneratedResponse,
        now: i64,
    ) -> Result<CacheEntry, SkipReason> {
        let redirect = generated
            .redirect
            .as_ref()
            .filter(|(_, location)| self.config.cache_redirects && !location.is_empty());

        if generated.has_blank_body() && redirect.is_none() {
            return Err(SkipReason::EmptyBody);
        }

        if (500..600).contains(&generated.status) {
            return Err(SkipReason::ServerError);
        }

        let mut headers = generated.headers.clone();
        headers.retain(|name| !self.config.never_persists(name));

        if headers.contains("set-cookie") {
            return Err(SkipReason::SetCookie);
        }

        let origin_max_age = headers
            .get("cache-control")
            .and_then(|values| values.iter().find_map(|value| max_age(value)));
        let max_age_seconds = self.config.effective_max_age(origin_max_age);
        let ttl_seconds = self.config.entry_ttl_seconds(max_age_seconds);

        let entry = CacheEntry {
            body: generated.body.clone(),
            created_at: target.started_at,
            headers,
            generation_ms: target.generation_ms,
            status: generated.status,
            status_line: generated.status_line.clone(),
            redirect_status: redirect.map(|(status, _)| *status),
            redirect_location: redirect.map(|(_, location)| location.clone()),
            content_version: target.content_version,
            max_age_seconds,
            hard_expiry_at: now
                .saturating_add(i64::try_from(ttl_seconds).unwrap_or(i64::MAX)),
        };

        if !target.dimensions.is_empty() {
            self.store
                .put_vary_dimensions(
                    target.url_key,
                    target.dimensions,
                    max_age_seconds.saturating_add(self.config.vary_ttl_slack_seconds),
                )
                .await;
        }

        let ttl_seconds =
            u64::try_from(entry.hard_expiry_at.saturating_sub(now).max(1)).unwrap_or(1);
        if !self.store.put_entry(target.key, &entry, ttl_seconds).await {
            return Err(SkipReason::StoreWrite);
        }

        debug!(
            url = %target.url_key,
            max_age_seconds,
            ttl_seconds,
            bytes = entry.body.len(),
            "captured page"
        );

        Ok(entry)
    }
}

/// Extract the `max-age` directive of a `Cache-Control` value.
fn max_age(value: &str) -> Option<u64> {
    value.split(',').find_map(|directive| {
        let (name, seconds) = directive.trim().split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("max-age") {
            return None;
        }
        seconds.trim().trim_matches('"').parse().ok()
    })
}
