//! Storage, loader and processor contracts.
//!
//! Three capability-distinct interfaces, frequently combined on a single
//! object: a [`Loader`] is a read-only source of blobs, a [`Storage`] adds
//! the write side with metadata, and a [`Processor`] is a transformation
//! stage with a lifecycle. Implementations plug into the service as
//! ordered lists at construction time.

pub mod file;
pub mod http;

use crate::blob::Blob;
use crate::error::Error;
use crate::urlpath::Params;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;

/// Metadata-only descriptor returned by storages for freshness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub size: u64,
    pub modified_time: SystemTime,
}

/// Read-only source of blobs by image identifier.
///
/// [`Error::NotFound`] means "keep trying the next loader"; any other
/// error aborts the load phase.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn get(&self, req: &::http::request::Parts, image: &str) -> Result<Blob, Error>;
}

/// Read-write persistence of blobs, keyed by image identifier (or result
/// key when registered as a result storage).
#[async_trait]
pub trait Storage: Loader {
    async fn put(&self, image: &str, blob: &Blob) -> Result<(), Error>;
    async fn stat(&self, image: &str) -> Result<Stat, Error>;
    async fn delete(&self, image: &str) -> Result<(), Error>;
}

/// Recursive load callback handed to processors for sub-loads
/// (overlay and watermark sources).
pub type Load<'a> = &'a (dyn Fn(&str) -> BoxFuture<'a, Result<Blob, Error>> + Send + Sync);

/// Transformation stage with a process-wide lifecycle.
///
/// Returning [`Error::Pass`] declines the input and lets the next
/// processor try; any other error short-circuits the chain.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(
        &self,
        cancel: &CancellationToken,
        blob: Blob,
        params: &Params,
        load: Load<'_>,
    ) -> Result<Blob, Error>;

    async fn startup(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Maps request params to the key processed artifacts are stored under.
/// The default is the canonical operation path.
pub trait ResultKey: Send + Sync {
    fn generate(&self, params: &Params) -> String;
}

impl<F> ResultKey for F
where
    F: Fn(&Params) -> String + Send + Sync,
{
    fn generate(&self, params: &Params) -> String {
        self(params)
    }
}

/// Object-identity comparison between a loader and a storage handle.
///
/// "Same store" detection must be identity, not structure: a loader that
/// is also a configured storage is recognized by registering the same
/// `Arc` on both lists.
pub(crate) fn same_instance(loader: &Arc<dyn Loader>, storage: &Arc<dyn Storage>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(loader), Arc::as_ptr(storage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::urlpath::Params;

    struct Dummy;

    #[async_trait]
    impl Loader for Dummy {
        async fn get(&self, _req: &::http::request::Parts, image: &str) -> Result<Blob, Error> {
            Ok(Blob::from_bytes(image.to_string()))
        }
    }

    #[async_trait]
    impl Storage for Dummy {
        async fn put(&self, _image: &str, _blob: &Blob) -> Result<(), Error> {
            Ok(())
        }
        async fn stat(&self, _image: &str) -> Result<Stat, Error> {
            Err(Error::NotFound)
        }
        async fn delete(&self, _image: &str) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn test_same_instance_by_identity() {
        let shared = Arc::new(Dummy);
        let as_loader: Arc<dyn Loader> = shared.clone();
        let as_storage: Arc<dyn Storage> = shared;
        assert!(same_instance(&as_loader, &as_storage));

        let other: Arc<dyn Storage> = Arc::new(Dummy);
        assert!(!same_instance(&as_loader, &other));
    }

    #[test]
    fn test_result_key_closure() {
        let keyer = |p: &Params| format!("prefix:{}", p.path);
        let params = Params {
            path: "foo".to_string(),
            ..Default::default()
        };
        assert_eq!(keyer.generate(&params), "prefix:foo");
    }
}
