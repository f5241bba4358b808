//! Request pipeline orchestration.
//!
//! The [`Service`] owns the ordered plug-in lists and drives a request
//! through them: result-storage read, source load, storage write-through,
//! processing, result write-through. Work is deduplicated per result key
//! by the suppressor and bounded by the admission gate. The pipeline and
//! the storage writes run on detached tasks, so a client disconnect drops
//! the waiting request without killing work other requests (or the
//! write-through) depend on; the work is bounded by its own load, process
//! and save deadlines instead.

mod builder;

pub use builder::ServiceBuilder;

use crate::blob::Blob;
use crate::error::Error;
use crate::gate::Gate;
use crate::storage::{same_instance, Loader, Processor, ResultKey, Storage};
use crate::suppress::{Forget, SuppressScope, Suppressor};
use crate::urlpath::{self, Filter, Params, Signer};
use futures::future::{join_all, BoxFuture};
use http::request::Parts;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Tunables carried by a built service.
pub(crate) struct Settings {
    pub unsafe_enabled: bool,
    pub auto_webp: bool,
    pub auto_avif: bool,
    pub base_filters: Vec<Filter>,
    pub request_timeout: Duration,
    pub load_timeout: Duration,
    pub save_timeout: Duration,
    pub process_timeout: Duration,
    pub modified_time_check: bool,
    pub cache_header_ttl: Duration,
    pub cache_header_swr: Duration,
    pub cache_header_no_cache: bool,
    pub disable_error_body: bool,
    pub disable_params_endpoint: bool,
    pub base_path_redirect: Option<String>,
    pub enable_etag: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            unsafe_enabled: false,
            auto_webp: false,
            auto_avif: false,
            base_filters: Vec::new(),
            request_timeout: Duration::from_secs(30),
            load_timeout: Duration::from_secs(20),
            save_timeout: Duration::from_secs(20),
            process_timeout: Duration::from_secs(20),
            modified_time_check: false,
            cache_header_ttl: Duration::from_secs(7 * 24 * 3600),
            cache_header_swr: Duration::from_secs(24 * 3600),
            cache_header_no_cache: false,
            disable_error_body: false,
            disable_params_endpoint: false,
            base_path_redirect: None,
            enable_etag: true,
        }
    }
}

pub(crate) struct Inner {
    pub loaders: Vec<Arc<dyn Loader>>,
    pub storages: Vec<Arc<dyn Storage>>,
    pub result_storages: Vec<Arc<dyn Storage>>,
    pub processors: Vec<Arc<dyn Processor>>,
    pub signer: Option<Arc<dyn Signer>>,
    pub result_key: Option<Arc<dyn ResultKey>>,
    pub suppressor: Suppressor,
    pub gate: Gate,
    pub settings: Settings,
}

/// A processor chain failure, optionally with the last good blob to serve
/// under the error's status.
struct ProcessFailure {
    error: Error,
    fallback: Option<Blob>,
}

/// The request-processing engine core.
#[derive(Clone)]
pub struct Service {
    pub(crate) inner: Arc<Inner>,
}

impl Service {
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    /// Runs processor startup hooks in declaration order, propagating the
    /// first failure.
    pub async fn startup(&self) -> Result<(), Error> {
        for processor in &self.inner.processors {
            processor.startup().await?;
        }
        Ok(())
    }

    /// Runs processor shutdown hooks in reverse order, best-effort;
    /// returns the first error observed after all hooks ran.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let mut first_err = None;
        for processor in self.inner.processors.iter().rev() {
            if let Err(e) = processor.shutdown().await {
                warn!(error = %e, "processor shutdown failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Parses and authorizes a request path, then applies base filters and
    /// Accept-header format negotiation.
    pub fn request_params(&self, path: &str, accept: Option<&str>) -> Result<Params, Error> {
        let mut params = urlpath::parse(path);
        self.authorize(&params)?;

        let settings = &self.inner.settings;
        let mut amended = false;
        if !settings.base_filters.is_empty() {
            params.filters.extend(settings.base_filters.iter().cloned());
            amended = true;
        }
        if !params.has_format_filter() {
            if let Some(accept) = accept {
                // AVIF outranks WebP when both are negotiable
                if settings.auto_avif && accepts_mime(accept, "image/avif") {
                    params.filters.push(Filter::new("format", "avif"));
                    amended = true;
                } else if settings.auto_webp && accepts_mime(accept, "image/webp") {
                    params.filters.push(Filter::new("format", "webp"));
                    amended = true;
                }
            }
        }
        if amended {
            params.path = urlpath::generate(&params);
        }
        Ok(params)
    }

    fn authorize(&self, params: &Params) -> Result<(), Error> {
        if params.unsafe_ {
            return if self.inner.settings.unsafe_enabled {
                Ok(())
            } else {
                Err(Error::SignatureMismatch)
            };
        }
        match &self.inner.signer {
            Some(signer) if !params.hash.is_empty() && signer.sign(&params.path) == params.hash => {
                Ok(())
            }
            _ => Err(Error::SignatureMismatch),
        }
    }

    /// The key processed artifacts are stored and deduplicated under.
    pub(crate) fn result_key(&self, params: &Params) -> String {
        match &self.inner.result_key {
            Some(generator) => generator.generate(params),
            None => params.path.clone(),
        }
    }

    /// Runs the full pipeline for an authorized request. The returned blob
    /// may carry an attached error, in which case its payload is served
    /// under the error's status.
    pub async fn serve(
        &self,
        req: &Parts,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<Blob, Error> {
        let _permit = self.inner.gate.acquire(cancel).await?;
        let scope = SuppressScope::new();
        self.do_serve(req, params, &scope, cancel).await
    }

    async fn do_serve(
        &self,
        req: &Parts,
        params: &Params,
        scope: &SuppressScope,
        cancel: &CancellationToken,
    ) -> Result<Blob, Error> {
        let result_key = self.result_key(params);
        let suppress_key = format!("res:{result_key}");
        let service = self.clone();
        let req = req.clone();
        let params = params.clone();
        let work_scope = scope.clone();
        self.inner
            .suppressor
            .suppress(scope, &suppress_key, cancel, move |forget| {
                service.pipeline(req, params, result_key, work_scope, forget)
            })
            .await
    }

    /// The suppressed unit of work for one result key. Runs detached from
    /// the requesting client; its lifetime is bounded by the load and
    /// process deadlines, not the caller's.
    async fn pipeline(
        self,
        req: Parts,
        params: Params,
        result_key: String,
        scope: SuppressScope,
        forget: Forget,
    ) -> Result<Blob, Error> {
        let cancel = CancellationToken::new();

        if let Some(blob) = self.read_result(&req, &result_key, &params.image).await {
            return Ok(blob);
        }

        let blob = self
            .load_storage(&req, &params.image, &scope, &cancel)
            .await?;
        if blob.attached_error().is_some() {
            // diagnostic payload with a non-fatal error; skip processing
            // and persistence, serve it as-is
            forget.forget();
            return Ok(blob);
        }
        if let Some(err) = blob.err().await {
            forget.forget();
            return Err(err);
        }
        if blob.is_empty().await {
            forget.forget();
            return Err(Error::NotFound);
        }

        match self
            .run_processors(&req, blob, &params, &scope, &cancel)
            .await
        {
            Ok(blob) => {
                self.save_result(&result_key, &blob);
                Ok(blob)
            }
            Err(ProcessFailure {
                error,
                fallback: Some(fallback),
            }) => {
                forget.forget();
                Ok(fallback.with_error(error))
            }
            Err(ProcessFailure {
                error,
                fallback: None,
            }) => {
                forget.forget();
                Err(error)
            }
        }
    }

    /// First fresh result-storage hit wins; a stale hit (by modified-time
    /// check) forces reprocessing.
    async fn read_result(&self, req: &Parts, result_key: &str, image: &str) -> Option<Blob> {
        for storage in &self.inner.result_storages {
            match storage.get(req, result_key).await {
                Ok(blob) => {
                    if blob.err().await.is_some() {
                        continue;
                    }
                    if self.result_is_fresh(storage, result_key, image).await {
                        debug!(result_key, "result storage hit");
                        return Some(blob);
                    }
                    debug!(result_key, "result storage hit is stale, reprocessing");
                    return None;
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    debug!(result_key, error = %e, "result storage read failed");
                    continue;
                }
            }
        }
        None
    }

    async fn result_is_fresh(
        &self,
        result_storage: &Arc<dyn Storage>,
        result_key: &str,
        image: &str,
    ) -> bool {
        if !self.inner.settings.modified_time_check || self.inner.storages.is_empty() {
            return true;
        }
        let result_stat = match result_storage.stat(result_key).await {
            Ok(stat) => stat,
            Err(_) => return true,
        };
        let stats = join_all(
            self.inner
                .storages
                .iter()
                .map(|storage| storage.stat(image)),
        )
        .await;
        !stats
            .into_iter()
            .flatten()
            .any(|stat| stat.modified_time > result_stat.modified_time)
    }

    /// Loads the source image through the ordered loaders, deduplicated
    /// per image key, and write-throughs the blob to every storage that
    /// did not produce it.
    async fn load_storage(
        &self,
        req: &Parts,
        image: &str,
        scope: &SuppressScope,
        cancel: &CancellationToken,
    ) -> Result<Blob, Error> {
        let suppress_key = format!("img:{image}");
        let service = self.clone();
        let req = req.clone();
        let image = image.to_string();
        self.inner
            .suppressor
            .suppress(scope, &suppress_key, cancel, move |forget| {
                service.load_and_store(req, image, forget)
            })
            .await
    }

    async fn load_and_store(self, req: Parts, image: String, forget: Forget) -> Result<Blob, Error> {
        let loaded = timeout(
            self.inner.settings.load_timeout,
            self.load_from_loaders(&req, &image),
        )
        .await;
        let (blob, origin) = match loaded {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                forget.forget();
                return Err(e);
            }
            Err(_) => {
                forget.forget();
                return Err(Error::Timeout);
            }
        };
        if blob.err().await.is_some() || blob.is_empty().await {
            // never persist errored or empty loads, and don't pin them for
            // later callers either
            forget.forget();
            return Ok(blob);
        }
        self.save_source(&origin, &image, &blob);
        Ok(blob)
    }

    async fn load_from_loaders(
        &self,
        req: &Parts,
        image: &str,
    ) -> Result<(Blob, Arc<dyn Loader>), Error> {
        if image.is_empty() {
            return Err(Error::NotFound);
        }
        for loader in &self.inner.loaders {
            match loader.get(req, image).await {
                Ok(blob) => return Ok((blob, Arc::clone(loader))),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::NotFound)
    }

    /// Runs the processor chain under the process timeout. The first
    /// processor that accepts the blob produces the final result; `Pass`
    /// hands the unchanged blob to the next one.
    async fn run_processors(
        &self,
        req: &Parts,
        blob: Blob,
        params: &Params,
        scope: &SuppressScope,
        cancel: &CancellationToken,
    ) -> Result<Blob, ProcessFailure> {
        if self.inner.processors.is_empty() {
            return Ok(blob);
        }
        let load = move |image: &str| -> BoxFuture<'_, Result<Blob, Error>> {
            let image = image.to_string();
            Box::pin(async move { self.load_storage(req, &image, scope, cancel).await })
        };
        let chain = async {
            let current = blob;
            for processor in &self.inner.processors {
                match processor
                    .process(cancel, current.clone(), params, &load)
                    .await
                {
                    Ok(processed) => return Ok(processed),
                    Err(Error::Pass) => continue,
                    Err(error) => {
                        let fallback = if is_recoverable(&error) && !current.is_empty().await {
                            Some(current)
                        } else {
                            None
                        };
                        return Err(ProcessFailure { error, fallback });
                    }
                }
            }
            Ok(current)
        };
        match timeout(self.inner.settings.process_timeout, chain).await {
            Ok(result) => result,
            Err(_) => Err(ProcessFailure {
                error: Error::Timeout,
                fallback: None,
            }),
        }
    }

    /// Write-through of a freshly loaded source blob, skipping the storage
    /// that produced it (object identity). Detached from the request.
    fn save_source(&self, origin: &Arc<dyn Loader>, image: &str, blob: &Blob) {
        for storage in &self.inner.storages {
            if same_instance(origin, storage) {
                debug!(image, "skipping write-through to the originating storage");
                continue;
            }
            self.spawn_save(
                Arc::clone(storage),
                image.to_string(),
                blob.clone(),
                "storage",
            );
        }
    }

    /// Write-through of a processed result to every result storage.
    fn save_result(&self, result_key: &str, blob: &Blob) {
        for storage in &self.inner.result_storages {
            self.spawn_save(
                Arc::clone(storage),
                result_key.to_string(),
                blob.clone(),
                "result storage",
            );
        }
    }

    /// Saves on a detached task under the save timeout; failures are
    /// logged, never surfaced.
    fn spawn_save(&self, storage: Arc<dyn Storage>, key: String, blob: Blob, tier: &'static str) {
        let save_timeout = self.inner.settings.save_timeout;
        tokio::spawn(async move {
            match timeout(save_timeout, storage.put(&key, &blob)).await {
                Ok(Ok(())) => debug!(key, tier, "saved"),
                Ok(Err(e)) => warn!(key, tier, error = %e, "save failed"),
                Err(_) => warn!(key, tier, "save timed out"),
            }
        });
    }
}

/// Errors a processor may report while the input is still worth serving.
fn is_recoverable(error: &Error) -> bool {
    match error {
        Error::UnsupportedFormat => true,
        Error::Internal { status, .. } => (400..500).contains(status),
        _ => false,
    }
}

/// Exact MIME token match within an Accept header.
fn accepts_mime(accept: &str, mime: &str) -> bool {
    accept
        .split(',')
        .filter_map(|part| part.split(';').next())
        .any(|token| token.trim() == mime)
}
