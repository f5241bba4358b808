//! Pictor - on-the-fly image transformation service core.
//!
//! Given an HTTP request whose URL path encodes a source image identifier
//! and a pipeline of transformation operations, the engine fetches the
//! source through ordered loaders, applies the processor pipeline,
//! write-throughs intermediate and final artifacts to storage tiers, and
//! returns the result - enforcing URL signatures, bounded concurrency,
//! deduplication of in-flight work and per-stage timeouts.
//!
//! # High-level API
//!
//! ```ignore
//! use pictor::service::Service;
//! use pictor::storage::file::FileStorage;
//! use std::sync::Arc;
//!
//! let storage = Arc::new(FileStorage::new("/var/lib/pictor"));
//! let service = Service::builder()
//!     .with_loader(storage.clone())
//!     .with_storage(storage)
//!     .with_secret("my-secret")
//!     .build();
//! let app = pictor::http::router(service);
//! ```

pub mod blob;
pub mod error;
pub mod gate;
pub mod http;
pub mod logging;
pub mod service;
pub mod storage;
pub mod suppress;
pub mod urlpath;

pub use blob::Blob;
pub use error::Error;
pub use service::Service;

/// Version of the pictor library and CLI.
///
/// Synchronized across all components in the workspace; injected from
/// `Cargo.toml` at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
