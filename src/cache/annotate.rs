//! Optional HTML debug comments.

use bytes::{Bytes, BytesMut};

use super::entry::HeaderSet;

/// Insert `comment` right before the first `<head` tag of an HTML body.
///
/// Bodies that declare a non-HTML content type, or have no `<head`, are
/// returned unchanged.
pub fn insert_before_head(body: &Bytes, headers: &HeaderSet, comment: &str) -> Bytes {
    if let Some(content_type) = headers.first("content-type") {
        if !content_type.starts_with("text/html") {
            return body.clone();
        }
    }

    let Some(position) = find(body, b"<head") else {
        return body.clone();
    };

    let mut annotated = BytesMut::with_capacity(body.len() + comment.len());
    annotated.extend_from_slice(&body[..position]);
    annotated.extend_from_slice(comment.as_bytes());
    annotated.extend_from_slice(&body[position..]);
    annotated.freeze()
}

pub fn just_cached(generation_ms: u64, stored_bytes: usize, max_age_seconds: u64) -> String {
    format!(
        "<!--\n\tgenerated in {:.3} seconds\n\t{stored_bytes} bytes cached for {max_age_seconds} seconds\n-->\n",
        generation_ms as f64 / 1000.0
    )
}

pub fn served_from_cache(
    age_seconds: i64,
    generation_ms: u64,
    serving_ms: u64,
    expires_in: i64,
) -> String {
    format!(
        "<!--\n\tgenerated {age_seconds} seconds ago\n\tgenerated in {:.3} seconds\n\tserved from cache in {:.3} seconds\n\texpires in {expires_in} seconds\n-->\n",
        generation_ms as f64 / 1000.0,
        serving_ms as f64 / 1000.0
    )
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_lands_before_head() {
        let body = Bytes::from_static(b"<html><head><title>x</title></head></html>");
        let annotated = insert_before_head(&body, &HeaderSet::new(), "<!-- hi -->");
        assert_eq!(
            &annotated[..],
            b"<html><!-- hi --><head><title>x</title></head></html>"
        );
    }

    #[test]
    fn non_html_bodies_are_untouched() {
        let body = Bytes::from_static(b"{\"head\":\"<head>\"}");
        let headers: HeaderSet = [("Content-Type", "application/json")].into_iter().collect();
        assert_eq!(insert_before_head(&body, &headers, "<!-- hi -->"), body);
    }

    #[test]
    fn bodies_without_head_are_untouched() {
        let body = Bytes::from_static(b"<p>fragment</p>");
        let headers: HeaderSet = [("content-type", "text/html; charset=utf-8")]
            .into_iter()
            .collect();
        assert_eq!(insert_before_head(&body, &headers, "<!-- hi -->"), body);
    }

    #[test]
    fn timings_render_in_seconds() {
        let comment = just_cached(1_250, 2_048, 600);
        assert!(comment.contains("generated in 1.250 seconds"));
        assert!(comment.contains("2048 bytes cached for 600 seconds"));
    }
}
