//! HTTP(S) source loader.
//!
//! Fetches images whose identifier is an absolute `http://` or `https://`
//! URL, with a connection-pooled client tuned for many small downloads.
//! An allowlist of source hosts limits which origins may be proxied.

use super::Loader;
use crate::blob::Blob;
use crate::error::Error;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_USER_AGENT: &str = concat!("pictor/", env!("CARGO_PKG_VERSION"));

/// Read-only loader over HTTP(S) origins.
pub struct HttpLoader {
    client: reqwest::Client,
    allowed_sources: Vec<String>,
}

impl HttpLoader {
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(DEFAULT_USER_AGENT)
            .pool_max_idle_per_host(64)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::internal(format!("failed to create http client: {e}")))?;
        Ok(Self {
            client,
            allowed_sources: Vec::new(),
        })
    }

    /// Restricts fetches to the given hosts. A leading `*.` matches any
    /// subdomain. Empty list = any host.
    pub fn with_allowed_sources(mut self, sources: impl IntoIterator<Item = String>) -> Self {
        self.allowed_sources = sources.into_iter().collect();
        self
    }

    fn host_allowed(&self, host: &str) -> bool {
        if self.allowed_sources.is_empty() {
            return true;
        }
        self.allowed_sources.iter().any(|allowed| {
            if let Some(suffix) = allowed.strip_prefix("*.") {
                host == suffix || host.ends_with(&format!(".{suffix}"))
            } else {
                host == allowed
            }
        })
    }
}

#[async_trait]
impl Loader for HttpLoader {
    async fn get(&self, req: &http::request::Parts, image: &str) -> Result<Blob, Error> {
        if !image.starts_with("http://") && !image.starts_with("https://") {
            return Err(Error::NotFound);
        }
        let url: reqwest::Url = image
            .parse()
            .map_err(|_| Error::Invalid)?;
        let host = url.host_str().ok_or(Error::Invalid)?;
        if !self.host_allowed(host) {
            debug!(host, "source host not allowed");
            return Err(Error::Invalid);
        }

        let mut request = self.client.get(url.clone());
        // pass the client's negotiation hints through to the origin
        for header in ["accept", "accept-encoding"] {
            if let Some(value) = req.headers.get(header) {
                request = request.header(header, value);
            }
        }

        let response = request.send().await.map_err(|e| {
            warn!(url = %url, error = %e, "source fetch failed");
            if e.is_timeout() {
                Error::Timeout
            } else {
                Error::internal(format!("source fetch failed: {e}"))
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(Error::NotFound);
        }
        if !status.is_success() {
            return Err(Error::with_status(
                format!("source returned {status}"),
                status.as_u16(),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::internal(format!("source read failed: {e}")))?;
        debug!(url = %url, bytes = bytes.len(), "source fetched");
        Ok(Blob::from_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts() -> http::request::Parts {
        let (parts, _) = http::Request::builder()
            .uri("https://example.com/")
            .body(())
            .expect("request")
            .into_parts();
        parts
    }

    #[test]
    fn test_host_allowlist() {
        let loader = HttpLoader::new()
            .unwrap()
            .with_allowed_sources(["example.com".to_string(), "*.cdn.net".to_string()]);
        assert!(loader.host_allowed("example.com"));
        assert!(!loader.host_allowed("evil.com"));
        assert!(loader.host_allowed("cdn.net"));
        assert!(loader.host_allowed("img.cdn.net"));
        assert!(!loader.host_allowed("notcdn.net"));
    }

    #[test]
    fn test_empty_allowlist_allows_all() {
        let loader = HttpLoader::new().unwrap();
        assert!(loader.host_allowed("anything.example"));
    }

    #[tokio::test]
    async fn test_non_url_identifier_is_not_found() {
        let loader = HttpLoader::new().unwrap();
        assert_eq!(
            loader.get(&parts(), "plain/image.jpg").await.err(),
            Some(Error::NotFound)
        );
    }

    #[tokio::test]
    async fn test_disallowed_host_is_invalid() {
        let loader = HttpLoader::new()
            .unwrap()
            .with_allowed_sources(["example.com".to_string()]);
        assert_eq!(
            loader.get(&parts(), "https://evil.com/x.jpg").await.err(),
            Some(Error::Invalid)
        );
    }
}
