//! Page cache middleware.
//!
//! The single place where cache decisions turn into HTTP responses: cached
//! pages, 304s and replayed redirects are written here, and generated
//! responses are buffered and handed to the engine for capture. Responses
//! that will not be captured stream through unbuffered.

use std::sync::Arc;

use axum::{
    body::{Body, BodyDataStream},
    extract::State,
    http::{
        HeaderMap, HeaderName, HeaderValue, Request, StatusCode,
        header::{CONTENT_LENGTH, LOCATION, TRANSFER_ENCODING, VARY},
        response::Parts,
    },
    middleware::Next,
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use tracing::{debug, instrument};

use super::{
    PageCache,
    capture::{GeneratedResponse, SkipReason},
    context::RequestContext,
    engine::Decision,
    entry::HeaderSet,
};

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct PageCacheState {
    pub cache: Arc<PageCache>,
}

impl PageCacheState {
    pub fn new(cache: PageCache) -> Self {
        Self {
            cache: Arc::new(cache),
        }
    }
}

/// Middleware answering from the page cache and capturing generated pages.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(state): State<PageCacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let ctx = RequestContext::from_parts(&parts);
    let request = Request::from_parts(parts, body);

    let pending = match state.cache.begin(ctx).await {
        Decision::Bypass(_) => return next.run(request).await,
        Decision::Serve(cached) => {
            return build_response(cached.status, &cached.headers, Body::from(cached.body));
        }
        Decision::NotModified(headers) => {
            return build_response(StatusCode::NOT_MODIFIED.as_u16(), &headers, Body::empty());
        }
        Decision::Redirect(redirect) => {
            return build_response(redirect.status, &redirect.headers, Body::empty());
        }
        Decision::Continue(pending) => pending,
    };

    let response = next.run(request).await;
    let (mut parts, body) = response.into_parts();
    let limit = state.cache.config().max_body_bytes;

    if !pending.will_capture() {
        state.cache.pass_through(pending).await;
        advertise_cookie_vary(&mut parts.headers);
        return Response::from_parts(parts, body);
    }

    if declared_length(&parts.headers).is_some_and(|length| length > limit) {
        state.cache.abandon(pending, SkipReason::Oversized).await;
        advertise_cookie_vary(&mut parts.headers);
        return Response::from_parts(parts, body);
    }

    let bytes = match buffer_body(body, limit).await {
        Buffered::Complete(bytes) => bytes,
        Buffered::Incomplete { body, reason } => {
            debug!(limit, reason = reason.as_str(), "response streamed past the page cache");
            state.cache.abandon(pending, reason).await;
            advertise_cookie_vary(&mut parts.headers);
            return Response::from_parts(parts, body);
        }
    };

    let generated = state
        .cache
        .finish(pending, generated_response(&parts, bytes))
        .await;

    let mut parts = parts;
    parts.status = StatusCode::from_u16(generated.status).unwrap_or(parts.status);
    parts.headers = header_map(&generated.headers);
    Response::from_parts(parts, Body::from(generated.body))
}

/// A response body read for capture.
enum Buffered {
    Complete(Bytes),
    /// Reading stopped early. `body` replays what was read, then the rest.
    Incomplete { body: Body, reason: SkipReason },
}

/// Read `body` into memory unless it grows past `limit` or fails.
async fn buffer_body(body: Body, limit: usize) -> Buffered {
    let mut stream = body.into_data_stream();
    let mut chunks = Vec::new();
    let mut size = 0usize;

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(chunk) => {
                size = size.saturating_add(chunk.len());
                chunks.push(chunk);
                if size > limit {
                    return Buffered::Incomplete {
                        body: replay(chunks, None, stream),
                        reason: SkipReason::Oversized,
                    };
                }
            }
            Err(err) => {
                return Buffered::Incomplete {
                    body: replay(chunks, Some(err), stream),
                    reason: SkipReason::BodyError,
                };
            }
        }
    }

    let mut buffer = BytesMut::with_capacity(size);
    for chunk in chunks {
        buffer.extend_from_slice(&chunk);
    }
    Buffered::Complete(buffer.freeze())
}

fn replay(chunks: Vec<Bytes>, failure: Option<axum::Error>, rest: BodyDataStream) -> Body {
    let read = chunks
        .into_iter()
        .map(Ok::<Bytes, axum::Error>)
        .chain(failure.map(Err));
    Body::from_stream(stream::iter(read).chain(rest))
}

/// Add `Vary: Cookie` unless the response already varies on cookies.
fn advertise_cookie_vary(headers: &mut HeaderMap) {
    let already = headers
        .get_all(VARY)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|name| name.trim().eq_ignore_ascii_case("cookie"));
    if !already {
        headers.append(VARY, HeaderValue::from_static("Cookie"));
    }
}

fn generated_response(parts: &Parts, body: Bytes) -> GeneratedResponse {
    let headers: HeaderSet = parts
        .headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|value| (name.as_str(), value)))
        .collect();

    let redirect = parts
        .status
        .is_redirection()
        .then(|| headers.first(LOCATION.as_str()))
        .flatten()
        .map(|location| (parts.status.as_u16(), location.to_string()));

    GeneratedResponse {
        status: parts.status.as_u16(),
        status_line: Some(format!("{:?} {}", parts.version, parts.status)),
        headers,
        body,
        redirect,
    }
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Convert to a header map, leaving message framing to the server.
fn header_map(headers: &HeaderSet) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in headers.iter() {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                map.append(name.clone(), value);
            }
        }
    }
    map
}

/// Build a response from cached data.
fn build_response(status: u16, headers: &HeaderSet, body: Body) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = header_map(headers);
    response
}

#[cfg(test)]
mod tests {
    use axum::http::Version;

    use super::*;

    #[test]
    fn header_map_skips_framing_headers() {
        let headers: HeaderSet = [
            ("Content-Length", "12"),
            ("Transfer-Encoding", "chunked"),
            ("X-Frame-Options", "DENY"),
            ("Vary", "Cookie"),
            ("Vary", "Accept-Encoding"),
        ]
        .into_iter()
        .collect();

        let map = header_map(&headers);
        assert!(map.get(CONTENT_LENGTH).is_none());
        assert!(map.get(TRANSFER_ENCODING).is_none());
        assert_eq!(map.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(map.get_all("vary").iter().count(), 2);
    }

    #[test]
    fn redirects_are_detected_from_status_and_location() {
        let response = Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .version(Version::HTTP_11)
            .header(LOCATION, "/new")
            .body(())
            .unwrap();
        let (parts, _) = response.into_parts();

        let generated = generated_response(&parts, Bytes::new());
        assert_eq!(generated.redirect, Some((301, "/new".to_string())));
        assert_eq!(
            generated.status_line.as_deref(),
            Some("HTTP/1.1 301 Moved Permanently")
        );
    }

    #[test]
    fn cookie_vary_is_not_repeated() {
        let mut headers = HeaderMap::new();
        headers.insert(VARY, HeaderValue::from_static("Accept-Encoding, Cookie"));
        advertise_cookie_vary(&mut headers);
        assert_eq!(headers.get_all(VARY).iter().count(), 1);

        let mut bare = HeaderMap::new();
        advertise_cookie_vary(&mut bare);
        assert_eq!(bare.get(VARY).unwrap(), "Cookie");
    }

    #[tokio::test]
    async fn small_bodies_are_buffered_whole() {
        let body = Body::from_stream(stream::iter(
            ["<p>", "hi", "</p>"].map(Ok::<_, std::io::Error>),
        ));
        match buffer_body(body, 64).await {
            Buffered::Complete(bytes) => assert_eq!(bytes, Bytes::from_static(b"<p>hi</p>")),
            Buffered::Incomplete { reason, .. } => panic!("unexpected skip: {reason:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_bodies_are_replayed_in_full() {
        let chunks = ["0123456789"; 4].map(Ok::<_, std::io::Error>);
        let body = Body::from_stream(stream::iter(chunks));
        match buffer_body(body, 16).await {
            Buffered::Complete(_) => panic!("body should not fit"),
            Buffered::Incomplete { body, reason } => {
                assert_eq!(reason, SkipReason::Oversized);
                let replayed = axum::body::to_bytes(body, usize::MAX).await.unwrap();
                assert_eq!(replayed, Bytes::from("0123456789".repeat(4)));
            }
        }
    }

    #[test]
    fn cached_status_falls_back_to_ok() {
        let response = build_response(1000, &HeaderSet::new(), Body::empty());
        assert_eq!(response.status(), StatusCode::OK);
    }
}
