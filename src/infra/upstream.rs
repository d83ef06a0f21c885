//! Reverse proxy to the application whose pages are cached.

use axum::{
    body::Body,
    extract::State,
    http::{
        HeaderMap, HeaderName, Request, StatusCode,
        header::{CONNECTION, HOST, TRANSFER_ENCODING},
    },
    response::{IntoResponse, Response},
};
use reqwest::{Client, Url, redirect};
use tracing::{instrument, warn};

use crate::config::UpstreamSettings;

use super::error::InfraError;

const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

#[derive(Clone, Debug)]
pub struct Upstream {
    client: Client,
    base: Url,
}

impl Upstream {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(concat!("pagefront/", env!("CARGO_PKG_VERSION")))
            .redirect(redirect::Policy::none())
            .timeout(settings.timeout)
            .build()
            .map_err(|err| InfraError::configuration(format!("failed to build client: {err}")))?;

        Ok(Self {
            client,
            base: settings.base_url.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Resolve a request target against the upstream base URL.
    pub fn url_for(&self, path_and_query: &str) -> Result<Url, InfraError> {
        self.base
            .join(path_and_query)
            .map_err(|err| InfraError::upstream(format!("invalid target `{path_and_query}`: {err}")))
    }

    /// Forward a request and buffer the upstream answer.
    pub async fn forward(&self, request: Request<Body>) -> Result<Response, InfraError> {
        let (parts, body) = request.into_parts();
        let target = parts
            .uri
            .path_and_query()
            .map_or("/", |value| value.as_str());
        let url = self.url_for(target)?;

        let body = axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES)
            .await
            .map_err(|err| InfraError::upstream(format!("failed to read request body: {err}")))?;

        let mut headers = strip_hop_by_hop(&parts.headers);
        if let Some(host) = parts.headers.get(HOST) {
            headers.insert(FORWARDED_HOST, host.clone());
        }

        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| InfraError::upstream(format!("request failed: {err}")))?;

        let status = upstream.status();
        let headers = strip_hop_by_hop(upstream.headers());
        let bytes = upstream
            .bytes()
            .await
            .map_err(|err| InfraError::upstream(format!("failed to read response: {err}")))?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Fallback handler sending every request to the upstream application.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_handler(State(upstream): State<Upstream>, request: Request<Body>) -> Response {
    match upstream.forward(request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "upstream request failed");
            (StatusCode::BAD_GATEWAY, "Bad gateway").into_response()
        }
    }
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lowered = name.as_str();
        if name == HOST
            || name == TRANSFER_ENCODING
            || HOP_BY_HOP.contains(&lowered)
            || listed.iter().any(|entry| entry == lowered)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::HeaderValue;

    use super::*;

    fn upstream(base: &str) -> Upstream {
        Upstream::new(&UpstreamSettings {
            base_url: Url::parse(base).unwrap(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn targets_resolve_against_base() {
        let upstream = upstream("http://app.internal:3000/");
        assert_eq!(
            upstream.url_for("/blog/post?p=4").unwrap().as_str(),
            "http://app.internal:3000/blog/post?p=4"
        );
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert(HOST, HeaderValue::from_static("example.com"));
        headers.insert("accept", HeaderValue::from_static("text/html"));

        let stripped = strip_hop_by_hop(&headers);
        assert_eq!(stripped.len(), 1);
        assert_eq!(stripped.get("accept").unwrap(), "text/html");
    }
}
