//! Immutable per-request snapshot.
//!
//! A [`RequestContext`] is built once at the HTTP boundary and threaded
//! through key construction, vary evaluation and conditional checks.

use std::collections::BTreeMap;

use axum::http::{Method, request::Parts};
use url::form_urlencoded;

use super::config::CacheConfig;

/// The request fields the cache decision depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    host: String,
    method: Method,
    path: String,
    query: BTreeMap<String, String>,
    protocol: String,
    tls: bool,
    cookies: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
    has_body: bool,
}

/// Why a request skipped the cache entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassReason {
    /// Caching is switched off (`max_age_seconds = 0`).
    Disabled,
    Method,
    RequestBody,
    Cookie(String),
}

impl BypassReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BypassReason::Disabled => "disabled",
            BypassReason::Method => "method",
            BypassReason::RequestBody => "request_body",
            BypassReason::Cookie(_) => "cookie",
        }
    }
}

impl RequestContext {
    /// Build a context from a method, host and request target (`/path?query`).
    pub fn new(method: Method, host: impl Into<String>, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (target, BTreeMap::new()),
        };

        Self {
            host: host.into(),
            method,
            path: if path.is_empty() { "/" } else { path }.to_string(),
            query,
            protocol: "HTTP/1.1".to_string(),
            tls: false,
            cookies: BTreeMap::new(),
            headers: BTreeMap::new(),
            has_body: false,
        }
    }

    /// Shorthand for a plain GET.
    pub fn get(host: impl Into<String>, target: &str) -> Self {
        Self::new(Method::GET, host, target)
    }

    /// Capture the relevant parts of an incoming HTTP request.
    pub fn from_parts(parts: &Parts) -> Self {
        let host = parts
            .headers
            .get(axum::http::header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|authority| authority.to_string()))
            .unwrap_or_default();

        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut ctx = Self::new(parts.method.clone(), host, target)
            .with_protocol(format!("{:?}", parts.version));

        for (name, value) in parts.headers.iter() {
            if let Ok(value) = value.to_str() {
                ctx = ctx.with_header(name.as_str(), value);
            }
        }

        let forwarded_tls = ctx
            .header("x-forwarded-proto")
            .is_some_and(|proto| proto.eq_ignore_ascii_case("https"));
        let uri_tls = parts.uri.scheme_str() == Some("https");
        ctx.tls = forwarded_tls || uri_tls;

        let declared_length = ctx
            .header("content-length")
            .and_then(|len| len.trim().parse::<u64>().ok())
            .unwrap_or(0);
        ctx.has_body = declared_length > 0 || ctx.header("transfer-encoding").is_some();

        ctx
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_body(mut self, has_body: bool) -> Self {
        self.has_body = has_body;
        self
    }

    /// Add a header. Names are folded to lowercase, repeated names are joined.
    /// A `Cookie` header also populates the cookie jar.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name == "cookie" {
            for (cookie_name, cookie_value) in parse_cookies(value) {
                self.cookies.insert(cookie_name, cookie_value);
            }
        }
        self.headers
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
        self
    }

    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.insert(name.to_string(), value.to_string());
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn cookies(&self) -> &BTreeMap<String, String> {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn if_none_match(&self) -> Option<&str> {
        self.header("if-none-match")
    }

    pub fn if_modified_since(&self) -> Option<&str> {
        self.header("if-modified-since")
    }

    pub fn has_body(&self) -> bool {
        self.has_body
    }

    /// Decide whether this request must skip the cache altogether.
    pub fn bypass_reason(&self, config: &CacheConfig) -> Option<BypassReason> {
        if self.method != Method::GET && self.method != Method::HEAD {
            return Some(BypassReason::Method);
        }

        if self.has_body {
            return Some(BypassReason::RequestBody);
        }

        for name in self.cookies.keys() {
            if config.exempt_cookies.iter().any(|exempt| exempt == name) {
                continue;
            }

            if config.bypass_cookies.iter().any(|bypass| bypass == name) {
                return Some(BypassReason::Cookie(name.clone()));
            }

            if config
                .bypass_cookie_prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()))
            {
                return Some(BypassReason::Cookie(name.clone()));
            }
        }

        None
    }
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

fn parse_cookies(header: &str) -> impl Iterator<Item = (String, String)> + '_ {
    header.split(';').filter_map(|pair| {
        let pair = pair.trim();
        if pair.is_empty() {
            return None;
        }
        match pair.split_once('=') {
            Some((name, value)) => Some((name.trim().to_string(), value.trim().to_string())),
            None => Some((pair.to_string(), String::new())),
        }
    })
}
