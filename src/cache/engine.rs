//! The per-request page cache state machine.
//!
//! [`PageCache::begin`] runs before the application and either answers the
//! request from the cache or hands back a [`PendingCapture`]. Once the
//! application produced its response, [`PageCache::finish`] snapshots it
//! and decorates the copy sent to the client.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use metrics::counter;
use tracing::{debug, info};
use url::Url;

use crate::util::clock::{Clock, SystemClock};

use super::admission::{Admission, AdmissionController};
use super::annotate;
use super::capture::{CaptureTarget, GeneratedResponse, ResponseCapture, SkipReason};
use super::conditional::{self, Conditional};
use super::config::CacheConfig;
use super::context::{BypassReason, RequestContext};
use super::entry::{CacheEntry, HeaderSet};
use super::keys::{CacheKey, UrlKey};
use super::redirect::{self, RedirectResponse};
use super::store::{EntryStore, Store};
use super::vary::{ResolvedVary, VaryError, VaryFunction, VaryRegistry};

const METRIC_HIT_TOTAL: &str = "pagefront_cache_hit_total";
const METRIC_MISS_TOTAL: &str = "pagefront_cache_miss_total";
const METRIC_NOT_MODIFIED_TOTAL: &str = "pagefront_cache_not_modified_total";
const METRIC_REDIRECT_TOTAL: &str = "pagefront_cache_redirect_total";
const METRIC_BYPASS_TOTAL: &str = "pagefront_cache_bypass_total";
const METRIC_STORE_TOTAL: &str = "pagefront_cache_store_total";
const METRIC_SKIP_TOTAL: &str = "pagefront_cache_skip_total";

/// A response served straight from an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub status_line: Option<String>,
    pub headers: HeaderSet,
    pub body: Bytes,
}

/// What the boundary adapter should do with a request.
#[derive(Debug)]
pub enum Decision {
    /// Not cacheable at all; run the application untouched.
    Bypass(BypassReason),
    /// Run the application, then hand its output to [`PageCache::finish`].
    Continue(PendingCapture),
    Serve(CachedResponse),
    /// Answer 304 with these headers and no body.
    NotModified(HeaderSet),
    Redirect(RedirectResponse),
}

/// State carried from [`PageCache::begin`] to [`PageCache::finish`].
#[derive(Debug)]
pub struct PendingCapture {
    ctx: RequestContext,
    started: Instant,
    started_at: i64,
    url_key: UrlKey,
    url_version: i64,
    admission: Admission,
    cancelled: bool,
}

impl PendingCapture {
    /// Abort the caching write path. The response still reaches the client.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// The application's output will be captured.
    pub fn will_capture(&self) -> bool {
        self.admission.should_cache
    }

    pub fn holds_genlock(&self) -> bool {
        self.admission.genlock
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn url_key(&self) -> &UrlKey {
        &self.url_key
    }
}

/// Content versions after an invalidation, per scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Invalidation {
    pub plain: Option<i64>,
    pub secure: Option<i64>,
}

pub struct PageCacheBuilder {
    config: CacheConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    vary: VaryRegistry,
}

impl PageCacheBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a vary dimension. Invalid or conflicting definitions are fatal.
    pub fn vary(mut self, function: VaryFunction) -> Result<Self, VaryError> {
        self.vary.register(function)?;
        Ok(self)
    }

    pub fn build(self) -> PageCache {
        let store = EntryStore::new(self.store, self.config.namespace());
        let admission = AdmissionController::new(&self.config, store.clone());
        PageCache {
            config: Arc::new(self.config),
            store,
            admission,
            vary: Arc::new(self.vary),
            clock: self.clock,
        }
    }
}

/// Page cache engine bound to one store handle.
#[derive(Clone)]
pub struct PageCache {
    config: Arc<CacheConfig>,
    store: EntryStore,
    admission: AdmissionController,
    vary: Arc<VaryRegistry>,
    clock: Arc<dyn Clock>,
}

impl PageCache {
    pub fn builder(config: CacheConfig, store: Arc<dyn Store>) -> PageCacheBuilder {
        PageCacheBuilder {
            config,
            store,
            clock: Arc::new(SystemClock),
            vary: VaryRegistry::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Decide how to answer `ctx` before the application runs.
    pub async fn begin(&self, ctx: RequestContext) -> Decision {
        let started = Instant::now();
        let now = self.clock.now();

        if !self.config.is_enabled() {
            return Decision::Bypass(BypassReason::Disabled);
        }
        if let Some(reason) = ctx.bypass_reason(&self.config) {
            debug!(reason = reason.as_str(), "page cache bypass");
            counter!(METRIC_BYPASS_TOTAL, "reason" => reason.as_str()).increment(1);
            return Decision::Bypass(reason);
        }

        let url_key = UrlKey::for_request(&ctx, &self.config.content_id_param);
        let url_version = self.store.url_version(&url_key).await;
        let key = self.lookup_key(&ctx, &url_key).await;
        let entry = self.store.entry(&key).await;

        let admission = self
            .admission
            .evaluate(&key, &url_key, entry.as_ref(), url_version, now)
            .await;

        if let Some(entry) = entry.filter(|entry| !admission.genlock && entry.is_fresh(now)) {
            return self.answer_from_entry(&ctx, entry, now, started);
        }

        debug!(
            url = %url_key,
            should_cache = admission.should_cache,
            requests = admission.requests,
            genlock = admission.genlock,
            "page cache miss"
        );
        counter!(METRIC_MISS_TOTAL).increment(1);

        Decision::Continue(PendingCapture {
            ctx,
            started,
            started_at: now,
            url_key,
            url_version,
            admission,
            cancelled: false,
        })
    }

    /// Capture the application's output and return the response to send.
    ///
    /// Never fails: store problems only mean the page was not cached.
    pub async fn finish(
        &self,
        pending: PendingCapture,
        mut generated: GeneratedResponse,
    ) -> GeneratedResponse {
        add_vary_cookie(&mut generated.headers);

        if !pending.will_capture() {
            return generated;
        }

        if pending.holds_genlock() {
            self.admission.lock().release(&pending.url_key).await;
        }

        if pending.cancelled {
            record_skip(SkipReason::Cancelled);
            return generated;
        }

        let resolved = self.vary.resolve_all(&pending.ctx);
        let key = CacheKey::build(&pending.ctx, &resolved);
        let dimensions = self.vary.dimension_set();
        let target = CaptureTarget {
            key: &key,
            url_key: &pending.url_key,
            dimensions: &dimensions,
            started_at: pending.started_at,
            generation_ms: elapsed_ms(pending.started),
            content_version: pending.url_version,
        };

        let now = self.clock.now();
        let capture = ResponseCapture::new(&self.config, &self.store);
        let entry = match capture.capture(target, &generated, now).await {
            Ok(entry) => entry,
            Err(reason) => {
                debug!(url = %pending.url_key, reason = reason.as_str(), "page not cached");
                record_skip(reason);
                return generated;
            }
        };

        info!(
            url = %pending.url_key,
            status = entry.status,
            max_age_seconds = entry.max_age_seconds,
            version = entry.content_version,
            "page cached"
        );
        counter!(METRIC_STORE_TOTAL).increment(1);

        self.decorate_captured(generated, &entry)
    }

    /// Release what `begin` acquired without capturing anything.
    pub async fn abandon(&self, pending: PendingCapture, reason: SkipReason) {
        if pending.will_capture() {
            record_skip(reason);
        }
        self.pass_through(pending).await;
    }

    /// Close out a request whose response is sent as generated.
    pub async fn pass_through(&self, pending: PendingCapture) {
        if pending.holds_genlock() {
            self.admission.lock().release(&pending.url_key).await;
        }
    }

    /// The entry `ctx` would be served from, fresh or not.
    pub async fn peek(&self, ctx: &RequestContext) -> Option<CacheEntry> {
        let url_key = UrlKey::for_request(ctx, &self.config.content_id_param);
        let key = self.lookup_key(ctx, &url_key).await;
        self.store.entry(&key).await
    }

    /// Mark the content behind `url` as changed.
    ///
    /// Bumps the content version of both the `http` and `https` form of the
    /// URL. Existing entries keep being served until a request wins the
    /// regeneration lock and replaces them.
    pub async fn invalidate_url(&self, url: &str) -> Invalidation {
        let Some(url) = parse_absolute(url) else {
            return Invalidation::default();
        };

        let mut invalidation = Invalidation::default();
        for (scheme, slot) in [
            ("http", &mut invalidation.plain),
            ("https", &mut invalidation.secure),
        ] {
            let mut variant = url.clone();
            if variant.set_scheme(scheme).is_err() {
                continue;
            }
            if let Some(url_key) = UrlKey::for_url(&variant, &self.config.content_id_param) {
                *slot = self.store.bump_version(&url_key).await;
            }
        }

        info!(
            url = %url,
            plain = invalidation.plain,
            secure = invalidation.secure,
            "page cache invalidated"
        );
        invalidation
    }

    /// Key under which the current entry for `ctx` is stored.
    async fn lookup_key(&self, ctx: &RequestContext, url_key: &UrlKey) -> CacheKey {
        let resolved = match self.store.vary_dimensions(url_key).await {
            Some(set) => self
                .vary
                .resolve_persisted(&set, ctx)
                .unwrap_or_else(|| self.vary.resolve_all(ctx)),
            None if self.vary.is_empty() => ResolvedVary::default(),
            None => self.vary.resolve_all(ctx),
        };
        CacheKey::build(ctx, &resolved)
    }

    fn answer_from_entry(
        &self,
        ctx: &RequestContext,
        entry: CacheEntry,
        now: i64,
        started: Instant,
    ) -> Decision {
        if let Some(redirect) = redirect::shortcut(&entry, &self.config) {
            debug!(status = redirect.status, location = %redirect.location, "cached redirect");
            counter!(METRIC_REDIRECT_TOTAL).increment(1);
            return Decision::Redirect(redirect);
        }

        let mut headers = entry.headers.clone();
        if self.config.send_validator_headers {
            for (name, values) in conditional::freshness_headers(&entry, now).iter() {
                for value in values {
                    headers.append(name, value.clone());
                }
            }
        }
        let mut headers = headers.layered_under(&HeaderSet::from(&self.config.always_send_headers));
        add_vary_cookie(&mut headers);

        if conditional::evaluate(&entry, ctx, self.config.send_validator_headers)
            == Conditional::NotModified
        {
            debug!(age = entry.age(now), "cached page not modified");
            counter!(METRIC_NOT_MODIFIED_TOTAL).increment(1);
            return Decision::NotModified(headers);
        }

        let body = if self.config.debug_annotations {
            let comment = annotate::served_from_cache(
                entry.age(now),
                entry.generation_ms,
                elapsed_ms(started),
                entry.remaining(now),
            );
            annotate::insert_before_head(&entry.body, &entry.headers, &comment)
        } else {
            entry.body.clone()
        };

        debug!(age = entry.age(now), status = entry.status, "page cache hit");
        counter!(METRIC_HIT_TOTAL).increment(1);

        Decision::Serve(CachedResponse {
            status: entry.status,
            status_line: entry.status_line,
            headers,
            body,
        })
    }

    fn decorate_captured(
        &self,
        mut generated: GeneratedResponse,
        entry: &CacheEntry,
    ) -> GeneratedResponse {
        if self.config.send_validator_headers {
            if !entry.headers.contains("last-modified") {
                generated
                    .headers
                    .set("last-modified", conditional::http_date(entry.created_at));
            }
            if !entry.headers.contains("cache-control") {
                generated.headers.set(
                    "cache-control",
                    format!("max-age={}, must-revalidate", entry.max_age_seconds),
                );
            }
        }

        generated.headers = generated
            .headers
            .layered_under(&HeaderSet::from(&self.config.always_send_headers));

        if self.config.debug_annotations {
            let stored_bytes = entry.encode().map(|raw| raw.len()).unwrap_or(0);
            let comment =
                annotate::just_cached(entry.generation_ms, stored_bytes, entry.max_age_seconds);
            generated.body = annotate::insert_before_head(&generated.body, &entry.headers, &comment);
        }

        generated
    }
}

/// Responses of cacheable pages depend on the cookie jar.
fn add_vary_cookie(headers: &mut HeaderSet) {
    let already = headers.get("vary").is_some_and(|values| {
        values.iter().any(|value| {
            value
                .split(',')
                .any(|name| name.trim().eq_ignore_ascii_case("cookie"))
        })
    });
    if !already {
        headers.append("vary", "Cookie");
    }
}

fn record_skip(reason: SkipReason) {
    counter!(METRIC_SKIP_TOTAL, "reason" => reason.as_str()).increment(1);
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Parse an absolute URL, treating scheme-less input as `http`.
fn parse_absolute(input: &str) -> Option<Url> {
    let input = input.trim();
    if input.contains("://") {
        return Url::parse(input).ok();
    }
    Url::parse(&format!("http://{}", input.trim_start_matches('/'))).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vary_cookie_is_added_once() {
        let mut headers = HeaderSet::new();
        add_vary_cookie(&mut headers);
        add_vary_cookie(&mut headers);
        assert_eq!(headers.get("vary"), Some(&["Cookie".to_string()][..]));

        let mut origin: HeaderSet = [("Vary", "Accept-Encoding, cookie")].into_iter().collect();
        add_vary_cookie(&mut origin);
        assert_eq!(origin.get("vary").map(<[String]>::len), Some(1));
    }

    #[test]
    fn scheme_less_urls_default_to_http() {
        let url = parse_absolute("example.com/about").expect("url");
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.host_str(), Some("example.com"));
        assert_eq!(url.path(), "/about");

        let secure = parse_absolute("https://example.com/").expect("url");
        assert_eq!(secure.scheme(), "https");
    }
}
