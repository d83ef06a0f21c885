//! Cache key definitions.
//!
//! Defines `CacheKey`, the full lookup identity of a response, and `UrlKey`,
//! the coarser identity used for content versioning.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};
use url::Url;

use super::context::RequestContext;
use super::vary::ResolvedVary;

/// Protocol that does not get its own variant.
const BASELINE_PROTOCOL: &str = "HTTP/1.0";

/// Canonical key material. Field order and `BTreeMap`s keep the encoding stable.
#[derive(Serialize)]
struct KeyMaterial<'a> {
    host: &'a str,
    method: &'a str,
    path: &'a str,
    query: &'a BTreeMap<String, String>,
    extra: BTreeMap<&'static str, &'a str>,
    #[serde(skip_serializing_if = "no_dimensions")]
    vary: &'a ResolvedVary,
    /// Only present when true, so plain-HTTP keys keep their historical shape.
    #[serde(skip_serializing_if = "is_false")]
    ssl: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn no_dimensions(vary: &&ResolvedVary) -> bool {
    vary.is_empty()
}

/// Lookup key of a cached response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Fold request identity and resolved vary dimensions into a key.
    pub fn build(ctx: &RequestContext, vary: &ResolvedVary) -> Self {
        let mut extra = BTreeMap::new();
        if ctx.protocol() != BASELINE_PROTOCOL {
            extra.insert("server_protocol", ctx.protocol());
        }

        let material = KeyMaterial {
            host: ctx.host(),
            method: ctx.method().as_str(),
            path: ctx.path(),
            query: ctx.query(),
            extra,
            vary,
            ssl: ctx.is_tls(),
        };

        // Serializing plain strings and maps into JSON cannot fail.
        let encoded = serde_json::to_vec(&material).unwrap_or_default();
        Self(digest(&encoded))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Store key of the admission request counter.
    pub fn counter_key(&self) -> String {
        format!("{}_req", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content identity of a URL: scheme, host, path and the content id parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UrlKey {
    permalink: String,
    digest: String,
}

impl UrlKey {
    pub fn for_request(ctx: &RequestContext, content_id_param: &str) -> Self {
        let scheme = if ctx.is_tls() { "https" } else { "http" };
        Self::from_parts(
            scheme,
            ctx.host(),
            ctx.path(),
            ctx.query_param(content_id_param),
            content_id_param,
        )
    }

    /// Build the key of an absolute URL, e.g. for invalidation.
    pub fn for_url(url: &Url, content_id_param: &str) -> Option<Self> {
        let host = url.host_str()?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let content_id = url
            .query_pairs()
            .filter(|(name, _)| name == content_id_param)
            .map(|(_, value)| value.into_owned())
            .last();

        Some(Self::from_parts(
            url.scheme(),
            &host,
            url.path(),
            content_id.as_deref(),
            content_id_param,
        ))
    }

    fn from_parts(
        scheme: &str,
        host: &str,
        path: &str,
        content_id: Option<&str>,
        content_id_param: &str,
    ) -> Self {
        let mut permalink = format!("{scheme}://{host}{path}");
        if let Some(id) = content_id {
            permalink.push('?');
            permalink.push_str(content_id_param);
            permalink.push('=');
            permalink.push_str(id);
        }
        let digest = digest(permalink.as_bytes());
        Self { permalink, digest }
    }

    pub fn as_str(&self) -> &str {
        &self.digest
    }

    pub fn permalink(&self) -> &str {
        &self.permalink
    }

    pub fn version_key(&self) -> String {
        format!("{}_version", self.digest)
    }

    pub fn genlock_key(&self) -> String {
        format!("{}_genlock", self.digest)
    }

    pub fn vary_key(&self) -> String {
        format!("{}_vary", self.digest)
    }
}

impl fmt::Display for UrlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.permalink)
    }
}

fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::vary::{Capability, VaryFunction, VaryRegistry, VaryValue};

    fn dimension(name: &str, header: &str) -> VaryFunction {
        let header_name = header.to_string();
        VaryFunction::new(name, [Capability::header(header)], move |req| {
            VaryValue::from(req.header(&header_name))
        })
        .expect("valid vary function")
    }

    #[test]
    fn identical_requests_share_a_key() {
        let a = RequestContext::get("example.com", "/a?x=1&y=2");
        let b = RequestContext::get("example.com", "/a?y=2&x=1");
        let vary = ResolvedVary::default();
        assert_eq!(CacheKey::build(&a, &vary), CacheKey::build(&b, &vary));
    }

    #[test]
    fn query_and_tls_change_the_key() {
        let vary = ResolvedVary::default();
        let plain = CacheKey::build(&RequestContext::get("example.com", "/a"), &vary);
        let paged = CacheKey::build(&RequestContext::get("example.com", "/a?page=2"), &vary);
        let secure = CacheKey::build(
            &RequestContext::get("example.com", "/a").with_tls(true),
            &vary,
        );
        assert_ne!(plain, paged);
        assert_ne!(plain, secure);
    }

    #[test]
    fn http10_shares_no_protocol_dimension() {
        let vary = ResolvedVary::default();
        let http10 = RequestContext::get("example.com", "/").with_protocol("HTTP/1.0");
        let http11 = RequestContext::get("example.com", "/");
        let http2 = RequestContext::get("example.com", "/").with_protocol("HTTP/2.0");
        assert_ne!(
            CacheKey::build(&http10, &vary),
            CacheKey::build(&http11, &vary)
        );
        assert_ne!(
            CacheKey::build(&http11, &vary),
            CacheKey::build(&http2, &vary)
        );
    }

    #[test]
    fn registration_order_does_not_matter() {
        let ctx = RequestContext::get("example.com", "/")
            .with_header("accept-language", "de")
            .with_header("user-agent", "Mobile");

        let mut forward = VaryRegistry::new();
        forward
            .register(dimension("lang", "accept-language"))
            .expect("register");
        forward
            .register(dimension("agent", "user-agent"))
            .expect("register");

        let mut backward = VaryRegistry::new();
        backward
            .register(dimension("agent", "user-agent"))
            .expect("register");
        backward
            .register(dimension("lang", "accept-language"))
            .expect("register");

        assert_eq!(
            CacheKey::build(&ctx, &forward.resolve_all(&ctx)),
            CacheKey::build(&ctx, &backward.resolve_all(&ctx))
        );
    }

    #[test]
    fn url_key_ignores_query_except_content_id() {
        let a = RequestContext::get("example.com", "/post?utm_source=x&p=5");
        let b = RequestContext::get("example.com", "/post?p=5&page=3");
        let c = RequestContext::get("example.com", "/post?p=6");

        let key_a = UrlKey::for_request(&a, "p");
        assert_eq!(key_a, UrlKey::for_request(&b, "p"));
        assert_ne!(key_a, UrlKey::for_request(&c, "p"));
        assert_eq!(key_a.permalink(), "http://example.com/post?p=5");
    }

    #[test]
    fn url_key_from_absolute_url_matches_request() {
        let ctx = RequestContext::get("example.com:8080", "/about").with_tls(true);
        let url = Url::parse("https://example.com:8080/about?ref=home").expect("valid url");
        assert_eq!(
            UrlKey::for_url(&url, "p"),
            Some(UrlKey::for_request(&ctx, "p"))
        );
    }

    #[test]
    fn derived_store_keys_share_the_digest() {
        let url_key = UrlKey::for_request(&RequestContext::get("example.com", "/"), "p");
        assert!(url_key.version_key().starts_with(url_key.as_str()));
        assert!(url_key.genlock_key().ends_with("_genlock"));
        assert!(url_key.vary_key().ends_with("_vary"));
    }
}
