//! Cache header policy and response tagging.

use chrono::Utc;
use http::StatusCode;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// How long error responses may be cached downstream.
const ERROR_CACHE_SECS: u64 = 10;

/// Cache-Control for a successful response:
/// `public, s-maxage=T, max-age=T, no-transform[, stale-while-revalidate=S]`
/// with the SWR clause omitted when S equals T or is zero.
pub(super) fn success_cache_control(ttl: Duration, swr: Duration) -> String {
    let ttl_secs = ttl.as_secs();
    let swr_secs = swr.as_secs();
    let mut value = format!("public, s-maxage={ttl_secs}, max-age={ttl_secs}, no-transform");
    if swr_secs > 0 && swr_secs != ttl_secs {
        value.push_str(&format!(", stale-while-revalidate={swr_secs}"));
    }
    value
}

/// Cache-Control for an error response: a short public cache, with
/// stale-while-revalidate only for server faults.
pub(super) fn error_cache_control(status: StatusCode) -> String {
    let mut value = format!(
        "public, s-maxage={ERROR_CACHE_SECS}, max-age={ERROR_CACHE_SECS}, no-transform"
    );
    if status.is_server_error() {
        value.push_str(&format!(", stale-while-revalidate={ERROR_CACHE_SECS}"));
    }
    value
}

/// Cache-Control and Pragma for the no-cache override.
pub(super) fn no_cache_headers() -> (&'static str, &'static str) {
    ("private, no-cache, no-store, must-revalidate", "no-cache")
}

/// An `Expires` value of right now, RFC 7231 format.
pub(super) fn expires_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Strong ETag over the response bytes.
pub(super) fn etag(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("\"{}\"", &hex[..32])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_cache_control_defaults() {
        let value = success_cache_control(
            Duration::from_secs(604800),
            Duration::from_secs(86400),
        );
        assert_eq!(
            value,
            "public, s-maxage=604800, max-age=604800, no-transform, stale-while-revalidate=86400"
        );
    }

    #[test]
    fn test_success_cache_control_swr_omitted_when_equal() {
        let value = success_cache_control(Duration::from_secs(169), Duration::from_secs(169));
        assert_eq!(value, "public, s-maxage=169, max-age=169, no-transform");
    }

    #[test]
    fn test_success_cache_control_swr_omitted_when_zero() {
        let value = success_cache_control(Duration::from_secs(60), Duration::ZERO);
        assert_eq!(value, "public, s-maxage=60, max-age=60, no-transform");
    }

    #[test]
    fn test_error_cache_control() {
        assert_eq!(
            error_cache_control(StatusCode::NOT_FOUND),
            "public, s-maxage=10, max-age=10, no-transform"
        );
        assert_eq!(
            error_cache_control(StatusCode::INTERNAL_SERVER_ERROR),
            "public, s-maxage=10, max-age=10, no-transform, stale-while-revalidate=10"
        );
    }

    #[test]
    fn test_etag_is_strong_and_stable() {
        let a = etag(b"payload");
        let b = etag(b"payload");
        let c = etag(b"other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with('"') && a.ends_with('"'));
        assert_eq!(a.len(), 34);
    }

    #[test]
    fn test_expires_format() {
        let value = expires_now();
        assert!(value.ends_with(" GMT"));
        // "Sat, 02 Aug 2026 00:00:00 GMT" is 29 characters
        assert_eq!(value.len(), 29);
    }
}
