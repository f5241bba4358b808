//! Re-readable binary payload handle.
//!
//! A [`Blob`] is a cheap-clone handle over a binary source. Every call to
//! [`Blob::reader`] yields an independent stream from the start, so the same
//! blob can be written to storage and to the response body concurrently.
//! MIME type and the first-bytes sniff are computed once and memoized.
//!
//! A blob may carry a payload AND an attached error: some loaders return
//! diagnostic bytes alongside a non-fatal error, and the pipeline serves
//! those bytes under the error's status.

mod mime;

use crate::error::Error;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::OnceCell;

/// How many leading bytes the sniff cache holds. Enough for every magic
/// number the MIME detector looks at.
const SNIFF_LEN: usize = 512;

/// A fresh, independent read stream over a blob's payload.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Produces a fresh reader plus the declared payload length (0 = unknown).
pub type BlobSupplier =
    Arc<dyn Fn() -> BoxFuture<'static, Result<(BlobReader, u64), Error>> + Send + Sync>;

/// Validation hook run against file metadata before a file-backed blob is
/// read (e.g. an expiration window check).
pub type StatCheck = Arc<dyn Fn(&std::fs::Metadata) -> Result<(), Error> + Send + Sync>;

enum Source {
    Empty,
    Bytes(Bytes),
    File {
        path: PathBuf,
        check: Option<StatCheck>,
    },
    Supplier {
        supplier: BlobSupplier,
        size: u64,
    },
}

struct Inner {
    source: Source,
    /// First `SNIFF_LEN` bytes, read once. A missing file surfaces its
    /// NotFound here on first access.
    sniff: OnceCell<Result<Bytes, Error>>,
    mime: OnceCell<Option<&'static str>>,
}

/// Handle to a potentially-large binary body.
#[derive(Clone)]
pub struct Blob {
    inner: Arc<Inner>,
    attached: Option<Box<Error>>,
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.inner.source {
            Source::Empty => "empty",
            Source::Bytes(_) => "bytes",
            Source::File { .. } => "file",
            Source::Supplier { .. } => "supplier",
        };
        f.debug_struct("Blob")
            .field("source", &kind)
            .field("attached", &self.attached)
            .finish()
    }
}

impl Blob {
    fn from_source(source: Source) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                sniff: OnceCell::new(),
                mime: OnceCell::new(),
            }),
            attached: None,
        }
    }

    /// A blob with no payload at all.
    pub fn empty() -> Self {
        Self::from_source(Source::Empty)
    }

    /// A blob backed by an in-memory byte buffer.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::from_source(Source::Bytes(bytes.into()))
    }

    /// A blob backed by a file on disk.
    ///
    /// The file is not touched until the first read; a missing file
    /// resolves to [`Error::NotFound`] at that point.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self::from_source(Source::File {
            path: path.into(),
            check: None,
        })
    }

    /// A file-backed blob with a metadata check run before every read.
    pub fn from_file_with_check(path: impl Into<PathBuf>, check: StatCheck) -> Self {
        Self::from_source(Source::File {
            path: path.into(),
            check: Some(check),
        })
    }

    /// A blob backed by a reader factory. `size` of 0 means unknown.
    pub fn from_supplier<F, Fut>(size: u64, supplier: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(BlobReader, u64), Error>> + Send + 'static,
    {
        let supplier: BlobSupplier = Arc::new(move || Box::pin(supplier()));
        Self::from_source(Source::Supplier { supplier, size })
    }

    /// Attaches an error to this blob. The payload stays readable; the
    /// pipeline serves it under the error's status.
    pub fn with_error(mut self, err: Error) -> Self {
        self.attached = Some(Box::new(err));
        self
    }

    /// The error attached by the producer, if any.
    pub fn attached_error(&self) -> Option<&Error> {
        self.attached.as_deref()
    }

    /// Opens a fresh independent reader from the start of the payload,
    /// returning it with the declared length (0 = unknown).
    pub async fn reader(&self) -> Result<(BlobReader, u64), Error> {
        match &self.inner.source {
            Source::Empty => Ok((Box::pin(tokio::io::empty()), 0)),
            Source::Bytes(bytes) => {
                let len = bytes.len() as u64;
                Ok((Box::pin(std::io::Cursor::new(bytes.clone())), len))
            }
            Source::File { path, check } => {
                let file = tokio::fs::File::open(path).await.map_err(Error::from)?;
                let meta = file.metadata().await.map_err(Error::from)?;
                if let Some(check) = check {
                    check(&meta)?;
                }
                let len = meta.len();
                Ok((Box::pin(file), len))
            }
            Source::Supplier { supplier, .. } => supplier().await,
        }
    }

    /// Reads the whole payload into memory.
    pub async fn bytes(&self) -> Result<Bytes, Error> {
        if let Source::Bytes(bytes) = &self.inner.source {
            return Ok(bytes.clone());
        }
        let (mut reader, len) = self.reader().await?;
        let mut buf = Vec::with_capacity(len.min(1 << 20) as usize);
        reader.read_to_end(&mut buf).await.map_err(Error::from)?;
        Ok(Bytes::from(buf))
    }

    /// The declared payload length, when known without reading.
    pub fn declared_size(&self) -> Option<u64> {
        match &self.inner.source {
            Source::Empty => Some(0),
            Source::Bytes(bytes) => Some(bytes.len() as u64),
            Source::File { .. } => None,
            Source::Supplier { size, .. } => (*size > 0).then_some(*size),
        }
    }

    /// First bytes of the payload, read once and memoized. The read error
    /// (if any) is memoized too, so a missing file keeps reporting
    /// NotFound without re-stat'ing.
    async fn sniff(&self) -> Result<Bytes, Error> {
        self.inner
            .sniff
            .get_or_init(|| async {
                let (reader, _) = self.reader().await?;
                let mut head = Vec::with_capacity(SNIFF_LEN);
                let mut limited = reader.take(SNIFF_LEN as u64);
                limited.read_to_end(&mut head).await.map_err(Error::from)?;
                Ok(Bytes::from(head))
            })
            .await
            .clone()
    }

    /// The error observed when first touching the payload, or the attached
    /// error if the producer set one.
    pub async fn err(&self) -> Option<Error> {
        if let Some(err) = &self.attached {
            return Some((**err).clone());
        }
        self.sniff().await.err()
    }

    /// True when the payload resolves to zero bytes (or the blob was
    /// created empty).
    pub async fn is_empty(&self) -> bool {
        match &self.inner.source {
            Source::Empty => true,
            Source::Bytes(bytes) => bytes.is_empty(),
            _ => matches!(self.sniff().await, Ok(head) if head.is_empty()),
        }
    }

    /// Lazily computed MIME type, memoized on first call.
    pub async fn mime(&self) -> Option<&'static str> {
        *self
            .inner
            .mime
            .get_or_init(|| async {
                match self.sniff().await {
                    Ok(head) => mime::detect(&head),
                    Err(_) => None,
                }
            })
            .await
    }

    /// MIME type with the wire default applied.
    pub async fn content_type(&self) -> &'static str {
        self.mime().await.unwrap_or("application/octet-stream")
    }
}
