//! Filesystem-backed storage.
//!
//! Maps image identifiers onto a base directory. Dot-files are refused by
//! default, additional blacklist patterns and a path prefix narrow what is
//! served, and an optional expiration window turns stale files into
//! expired loads.

use super::{Loader, Stat, Storage};
use crate::blob::{Blob, StatCheck};
use crate::error::Error;
use async_trait::async_trait;
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Loader + storage over a local directory tree.
pub struct FileStorage {
    base_dir: PathBuf,
    path_prefix: String,
    blacklists: Vec<Regex>,
    save_err_if_exists: bool,
    expiration: Option<Duration>,
}

impl FileStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            path_prefix: "/".to_string(),
            blacklists: vec![Regex::new(r"/\.").expect("dot-file regex")],
            save_err_if_exists: false,
            expiration: None,
        }
    }

    /// Restricts served images to those under the given prefix.
    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.starts_with('/') {
            prefix.insert(0, '/');
        }
        self.path_prefix = prefix;
        self
    }

    /// Adds a blacklist pattern matched against the normalized image path.
    pub fn with_blacklist(mut self, pattern: Regex) -> Self {
        self.blacklists.push(pattern);
        self
    }

    /// Refuse to overwrite existing files on save.
    pub fn with_save_err_if_exists(mut self, enabled: bool) -> Self {
        self.save_err_if_exists = enabled;
        self
    }

    /// Treat stored files older than the window as expired on load.
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Maps an image identifier to a path under the base directory.
    /// Blacklisted or out-of-prefix identifiers resolve to
    /// [`Error::Invalid`].
    fn resolve(&self, image: &str) -> Result<PathBuf, Error> {
        let normalized = normalize(image);
        let slashed = format!("/{normalized}");
        for blacklist in &self.blacklists {
            if blacklist.is_match(&slashed) {
                return Err(Error::Invalid);
            }
        }
        if !slashed.starts_with(&self.path_prefix) {
            return Err(Error::Invalid);
        }
        let relative = slashed
            .strip_prefix(&self.path_prefix)
            .unwrap_or(&normalized)
            .trim_start_matches('/');
        Ok(self.base_dir.join(relative))
    }

    fn expiration_check(&self) -> Option<StatCheck> {
        let expiration = self.expiration?;
        Some(Arc::new(move |meta: &std::fs::Metadata| {
            let modified = meta.modified().map_err(Error::from)?;
            match SystemTime::now().duration_since(modified) {
                Ok(age) if age > expiration => Err(Error::Expired),
                _ => Ok(()),
            }
        }))
    }
}

/// Collapses an image identifier to a clean relative path, dropping empty,
/// `.` and `..` segments so nothing escapes the base directory.
fn normalize(image: &str) -> String {
    let trimmed = image.trim_matches('/');
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(trimmed).components() {
        if let Component::Normal(seg) = component {
            if let Some(seg) = seg.to_str() {
                parts.push(seg);
            }
        }
    }
    parts.join("/")
}

#[async_trait]
impl Loader for FileStorage {
    async fn get(&self, _req: &http::request::Parts, image: &str) -> Result<Blob, Error> {
        let path = self.resolve(image)?;
        // existence is checked lazily: a missing file surfaces NotFound on
        // the blob's first read
        Ok(match self.expiration_check() {
            Some(check) => Blob::from_file_with_check(path, check),
            None => Blob::from_file(path),
        })
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn put(&self, image: &str, blob: &Blob) -> Result<(), Error> {
        let path = self.resolve(image)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::from)?;
        }
        if self.save_err_if_exists && tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(Error::internal(format!(
                "file already exists: {}",
                path.display()
            )));
        }
        let (mut reader, _) = blob.reader().await?;
        let mut file = tokio::fs::File::create(&path).await.map_err(Error::from)?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(Error::from)?;
        file.flush().await.map_err(Error::from)?;
        debug!(image, path = %path.display(), "stored file");
        Ok(())
    }

    async fn stat(&self, image: &str) -> Result<Stat, Error> {
        let path = self.resolve(image)?;
        let meta = tokio::fs::metadata(&path).await.map_err(Error::from)?;
        Ok(Stat {
            size: meta.len(),
            modified_time: meta.modified().map_err(Error::from)?,
        })
    }

    async fn delete(&self, image: &str) -> Result<(), Error> {
        let path = self.resolve(image)?;
        tokio::fs::remove_file(&path).await.map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn parts() -> http::request::Parts {
        let (parts, _) = http::Request::builder()
            .uri("https://example.com/")
            .body(())
            .expect("request")
            .into_parts();
        parts
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        storage
            .put("sub/dir/foo.jpg", &Blob::from_bytes("payload"))
            .await
            .unwrap();
        let blob = storage.get(&parts(), "sub/dir/foo.jpg").await.unwrap();
        assert_eq!(blob.bytes().await.unwrap(), Bytes::from("payload"));
    }

    #[tokio::test]
    async fn test_get_missing_resolves_not_found_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let blob = storage.get(&parts(), "nope.jpg").await.unwrap();
        assert_eq!(blob.err().await, Some(Error::NotFound));
    }

    #[tokio::test]
    async fn test_stat_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        storage.put("a.bin", &Blob::from_bytes("12345")).await.unwrap();
        let stat = storage.stat("a.bin").await.unwrap();
        assert_eq!(stat.size, 5);

        storage.delete("a.bin").await.unwrap();
        assert_eq!(storage.stat("a.bin").await.err(), Some(Error::NotFound));
    }

    #[tokio::test]
    async fn test_dot_files_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        assert_eq!(
            storage.get(&parts(), ".hidden").await.err(),
            Some(Error::Invalid)
        );
        assert_eq!(
            storage.get(&parts(), "sub/.hidden/x").await.err(),
            Some(Error::Invalid)
        );
    }

    #[tokio::test]
    async fn test_traversal_is_neutralized() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage
            .put("../escape.bin", &Blob::from_bytes("x"))
            .await
            .unwrap();
        // the file lands inside the base dir, not above it
        assert!(dir.path().join("escape.bin").exists());
    }

    #[tokio::test]
    async fn test_path_prefix_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).with_path_prefix("/allowed");
        assert_eq!(
            storage.get(&parts(), "other/foo.jpg").await.err(),
            Some(Error::Invalid)
        );
        assert!(storage.get(&parts(), "allowed/foo.jpg").await.is_ok());
    }

    #[tokio::test]
    async fn test_save_err_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).with_save_err_if_exists(true);
        storage.put("once.bin", &Blob::from_bytes("1")).await.unwrap();
        assert!(storage.put("once.bin", &Blob::from_bytes("2")).await.is_err());
    }

    #[tokio::test]
    async fn test_expiration_window() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).with_expiration(Duration::from_secs(3600));
        storage.put("fresh.bin", &Blob::from_bytes("x")).await.unwrap();
        // just written, well within the window
        let blob = storage.get(&parts(), "fresh.bin").await.unwrap();
        assert!(blob.err().await.is_none());

        let expired = FileStorage::new(dir.path()).with_expiration(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let blob = expired.get(&parts(), "fresh.bin").await.unwrap();
        assert_eq!(blob.err().await, Some(Error::Expired));
    }
}
