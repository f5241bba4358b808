//! Builder for [`Service`].

use super::{Inner, Service, Settings};
use crate::gate::Gate;
use crate::storage::{Loader, Processor, ResultKey, Storage};
use crate::suppress::Suppressor;
use crate::urlpath::{self, HmacSigner, Signer};
use std::sync::Arc;
use std::time::Duration;

/// Assembles a [`Service`] from ordered plug-in lists and settings.
///
/// Loaders, storages and processors are consulted in the order they are
/// registered. To make a storage also act as a loader (and be skipped on
/// write-through for blobs it produced itself), register the same `Arc`
/// on both lists.
pub struct ServiceBuilder {
    loaders: Vec<Arc<dyn Loader>>,
    storages: Vec<Arc<dyn Storage>>,
    result_storages: Vec<Arc<dyn Storage>>,
    processors: Vec<Arc<dyn Processor>>,
    signer: Option<Arc<dyn Signer>>,
    result_key: Option<Arc<dyn ResultKey>>,
    concurrency: usize,
    queue_size: usize,
    settings: Settings,
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self {
            loaders: Vec::new(),
            storages: Vec::new(),
            result_storages: Vec::new(),
            processors: Vec::new(),
            signer: None,
            result_key: None,
            concurrency: 0,
            queue_size: 0,
            settings: Settings::default(),
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loaders.push(loader);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storages.push(storage);
        self
    }

    pub fn with_result_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.result_storages.push(storage);
        self
    }

    pub fn with_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Installs the default HMAC-SHA1 signer with the given secret.
    pub fn with_secret(self, secret: impl Into<String>) -> Self {
        self.with_signer(Arc::new(HmacSigner::default_signer(secret)))
    }

    pub fn with_result_key(mut self, generator: Arc<dyn ResultKey>) -> Self {
        self.result_key = Some(generator);
        self
    }

    /// Authorizes requests whose first segment is the literal `unsafe`.
    pub fn with_unsafe(mut self, enabled: bool) -> Self {
        self.settings.unsafe_enabled = enabled;
        self
    }

    /// Appends the filters of the given base param string (e.g.
    /// `filters:watermark(logo.png)`) to every parsed request.
    pub fn with_base_params(mut self, base: impl AsRef<str>) -> Self {
        let parsed = urlpath::parse(base.as_ref().trim_end_matches('/'));
        self.settings.base_filters = parsed.filters;
        self
    }

    pub fn with_auto_webp(mut self, enabled: bool) -> Self {
        self.settings.auto_webp = enabled;
        self
    }

    pub fn with_auto_avif(mut self, enabled: bool) -> Self {
        self.settings.auto_avif = enabled;
        self
    }

    pub fn with_process_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_process_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.settings.request_timeout = timeout;
        self
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.settings.load_timeout = timeout;
        self
    }

    pub fn with_save_timeout(mut self, timeout: Duration) -> Self {
        self.settings.save_timeout = timeout;
        self
    }

    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.settings.process_timeout = timeout;
        self
    }

    /// Re-validate result-storage hits against the source storages'
    /// modified times.
    pub fn with_modified_time_check(mut self, enabled: bool) -> Self {
        self.settings.modified_time_check = enabled;
        self
    }

    pub fn with_cache_header_ttl(mut self, ttl: Duration) -> Self {
        self.settings.cache_header_ttl = ttl;
        self
    }

    pub fn with_cache_header_swr(mut self, swr: Duration) -> Self {
        self.settings.cache_header_swr = swr;
        self
    }

    pub fn with_cache_header_no_cache(mut self, enabled: bool) -> Self {
        self.settings.cache_header_no_cache = enabled;
        self
    }

    pub fn with_disable_error_body(mut self, disabled: bool) -> Self {
        self.settings.disable_error_body = disabled;
        self
    }

    pub fn with_disable_params_endpoint(mut self, disabled: bool) -> Self {
        self.settings.disable_params_endpoint = disabled;
        self
    }

    pub fn with_base_path_redirect(mut self, url: impl Into<String>) -> Self {
        self.settings.base_path_redirect = Some(url.into());
        self
    }

    pub fn with_etag(mut self, enabled: bool) -> Self {
        self.settings.enable_etag = enabled;
        self
    }

    pub fn build(self) -> Service {
        Service {
            inner: Arc::new(Inner {
                loaders: self.loaders,
                storages: self.storages,
                result_storages: self.result_storages,
                processors: self.processors,
                signer: self.signer,
                result_key: self.result_key,
                suppressor: Suppressor::new(),
                gate: Gate::new(self.concurrency, self.queue_size),
                settings: self.settings,
            }),
        }
    }
}
