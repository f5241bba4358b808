//! Pictor server binary.
//!
//! Wires the core service to an axum listener: configuration comes from an
//! optional INI file with CLI argument overrides, storage and loader
//! plug-ins are assembled from the configuration, and shutdown is
//! propagated to in-flight requests through a cancellation token.

mod config;
mod error;

use axum::extract::Request;
use axum::middleware::Next;
use clap::Parser;
use config::ServerConfig;
use error::CliError;
use pictor::service::Service;
use pictor::storage::file::FileStorage;
use pictor::storage::http::HttpLoader;
use pictor::urlpath::HmacSigner;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "pictor", version, about = "On-the-fly image transformation server")]
struct Cli {
    /// Config file path (INI)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind address, e.g. 0.0.0.0:8000
    #[arg(long)]
    bind: Option<String>,

    /// Accept requests with the literal `unsafe` segment instead of a
    /// signature
    #[arg(long = "unsafe")]
    unsafe_mode: bool,

    /// URL signature secret
    #[arg(long)]
    secret: Option<String>,

    /// Signature algorithm: sha1, sha256 or sha512
    #[arg(long)]
    signer_algorithm: Option<String>,

    /// Truncate signatures to this many characters (0 = full length)
    #[arg(long)]
    signer_truncate: Option<usize>,

    /// Maximum concurrent pipeline executions (0 = unlimited)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Additional requests allowed to queue for a slot (0 = unbounded)
    #[arg(long)]
    queue_size: Option<usize>,

    /// Source file storage directory (acts as loader and storage)
    #[arg(long)]
    storage_dir: Option<String>,

    /// Result file storage directory
    #[arg(long)]
    result_storage_dir: Option<String>,

    /// Disable the HTTP(S) source loader
    #[arg(long)]
    no_http_loader: bool,

    /// Insert format(webp) for clients that accept it
    #[arg(long)]
    auto_webp: bool,

    /// Insert format(avif) for clients that accept it
    #[arg(long)]
    auto_avif: bool,

    /// Write logs to this directory in addition to stdout
    #[arg(long)]
    log_dir: Option<String>,
}

impl Cli {
    fn apply(self, mut config: ServerConfig) -> Result<ServerConfig, CliError> {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if self.unsafe_mode {
            config.unsafe_mode = true;
        }
        if let Some(secret) = self.secret {
            config.secret = Some(secret);
        }
        if let Some(algorithm) = self.signer_algorithm {
            config.signer_alg = config::parse_signer_alg(&algorithm)?;
        }
        if let Some(truncate) = self.signer_truncate {
            config::validate_signer_truncate(truncate)?;
            config.signer_truncate = truncate;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(queue_size) = self.queue_size {
            config.queue_size = queue_size;
        }
        if let Some(dir) = self.storage_dir {
            config.storage_dir = Some(dir);
        }
        if let Some(dir) = self.result_storage_dir {
            config.result_storage_dir = Some(dir);
        }
        if self.no_http_loader {
            config.http_loader = false;
        }
        if self.auto_webp {
            config.auto_webp = true;
        }
        if self.auto_avif {
            config.auto_avif = true;
        }
        if let Some(dir) = self.log_dir {
            config.log_dir = Some(dir);
        }
        Ok(config)
    }
}

fn build_service(config: &ServerConfig) -> Result<Service, CliError> {
    let mut builder = Service::builder()
        .with_unsafe(config.unsafe_mode)
        .with_process_concurrency(config.concurrency)
        .with_process_queue_size(config.queue_size)
        .with_request_timeout(config.request_timeout)
        .with_load_timeout(config.load_timeout)
        .with_save_timeout(config.save_timeout)
        .with_process_timeout(config.process_timeout)
        .with_cache_header_ttl(config.cache_header_ttl)
        .with_cache_header_swr(config.cache_header_swr)
        .with_cache_header_no_cache(config.cache_header_no_cache)
        .with_disable_error_body(config.disable_error_body)
        .with_disable_params_endpoint(config.disable_params_endpoint)
        .with_auto_webp(config.auto_webp)
        .with_auto_avif(config.auto_avif)
        .with_modified_time_check(config.modified_time_check);

    if let Some(secret) = &config.secret {
        builder = builder.with_signer(Arc::new(HmacSigner::new(
            config.signer_alg,
            config.signer_truncate,
            secret.clone(),
        )));
    } else if !config.unsafe_mode {
        return Err(CliError::Config(
            "either a signature secret or --unsafe is required".to_string(),
        ));
    }
    if let Some(base_params) = &config.base_params {
        builder = builder.with_base_params(base_params);
    }
    if let Some(url) = &config.base_path_redirect {
        builder = builder.with_base_path_redirect(url.clone());
    }

    if let Some(dir) = &config.storage_dir {
        let mut storage = FileStorage::new(dir);
        if let Some(prefix) = &config.storage_path_prefix {
            storage = storage.with_path_prefix(prefix.clone());
        }
        if let Some(expiration) = config.storage_expiration {
            storage = storage.with_expiration(expiration);
        }
        let storage = Arc::new(storage);
        // the same handle on both lists, so blobs it produced are not
        // written back to it
        builder = builder.with_loader(storage.clone()).with_storage(storage);
    }
    if config.http_loader {
        let loader = HttpLoader::new()?
            .with_allowed_sources(config.http_allowed_sources.iter().cloned());
        builder = builder.with_loader(Arc::new(loader));
    }
    if let Some(dir) = &config.result_storage_dir {
        builder = builder.with_result_storage(Arc::new(FileStorage::new(dir)));
    }

    Ok(builder.build())
}

/// Gives every request its own cancellation token, derived from the
/// process shutdown token.
///
/// When the client disconnects mid-request, hyper drops this middleware's
/// future along with the handler; the drop guard then cancels that
/// request's token. Process shutdown cancels the parent and with it every
/// in-flight request token. Once the response head has been produced the
/// guard is disarmed; body streaming continues regardless of the token.
async fn attach_request_token(
    axum::extract::State(shutdown): axum::extract::State<CancellationToken>,
    mut req: Request,
    next: Next,
) -> axum::response::Response {
    let token = shutdown.child_token();
    let guard = token.clone().drop_guard();
    req.extensions_mut().insert(token);
    let response = next.run(req).await;
    guard.disarm();
    response
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();

    let base = match &cli.config {
        Some(path) => ServerConfig::load_from(path)?,
        None => ServerConfig::default(),
    };
    let config = cli.apply(base)?;

    let _logging_guard = match &config.log_dir {
        Some(dir) => pictor::logging::init_logging_with_file(
            dir,
            pictor::logging::default_log_file(),
        )?,
        None => pictor::logging::init_logging(),
    };

    let service = build_service(&config)?;
    service.startup().await?;

    let shutdown = CancellationToken::new();
    let app = pictor::http::router(service.clone()).layer(
        axum::middleware::from_fn_with_state(shutdown.clone(), attach_request_token),
    );

    let listener = TcpListener::bind(&config.bind).await?;
    info!(bind = %config.bind, version = pictor::VERSION, "pictor listening");

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            signal_token.cancel();
        })
        .await?;

    service.shutdown().await?;
    info!("shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "fatal");
        eprintln!("pictor: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    /// A router whose handler parks forever after exposing its request
    /// token through the shared slot.
    fn token_probe_app(
        shutdown: CancellationToken,
        slot: Arc<Mutex<Option<CancellationToken>>>,
        park: bool,
    ) -> axum::Router {
        axum::Router::new()
            .route(
                "/",
                get(move |axum::Extension(token): axum::Extension<CancellationToken>| {
                    let slot = Arc::clone(&slot);
                    async move {
                        *slot.lock().unwrap() = Some(token);
                        if park {
                            tokio::time::sleep(Duration::from_secs(60)).await;
                        }
                        ""
                    }
                }),
            )
            .layer(axum::middleware::from_fn_with_state(
                shutdown,
                attach_request_token,
            ))
    }

    async fn captured_token(slot: &Arc<Mutex<Option<CancellationToken>>>) -> CancellationToken {
        for _ in 0..500 {
            if let Some(token) = slot.lock().unwrap().clone() {
                return token;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("handler never received a request token");
    }

    #[tokio::test]
    async fn test_request_token_cancelled_on_client_disconnect() {
        let slot = Arc::new(Mutex::new(None));
        let app = token_probe_app(CancellationToken::new(), Arc::clone(&slot), true);

        let task = tokio::spawn(
            app.oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            ),
        );
        let token = captured_token(&slot).await;
        assert!(!token.is_cancelled());

        // the client goes away: the in-flight request future is dropped
        task.abort();
        let _ = task.await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_request_token_cancelled_on_shutdown() {
        let shutdown = CancellationToken::new();
        let slot = Arc::new(Mutex::new(None));
        let app = token_probe_app(shutdown.clone(), Arc::clone(&slot), true);

        let task = tokio::spawn(
            app.oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            ),
        );
        let token = captured_token(&slot).await;

        shutdown.cancel();
        assert!(token.is_cancelled());
        task.abort();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_request_token_survives_normal_completion() {
        let slot = Arc::new(Mutex::new(None));
        let app = token_probe_app(CancellationToken::new(), Arc::clone(&slot), false);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_success());

        // the guard was disarmed when the response head was produced
        let token = slot.lock().unwrap().clone().unwrap();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from([
            "pictor",
            "--bind",
            "127.0.0.1:1234",
            "--unsafe",
            "--concurrency",
            "4",
        ]);
        let config = cli.apply(ServerConfig::default()).unwrap();
        assert_eq!(config.bind, "127.0.0.1:1234");
        assert!(config.unsafe_mode);
        assert_eq!(config.concurrency, 4);
        // untouched values keep their defaults
        assert_eq!(config.queue_size, 0);
    }

    #[test]
    fn test_cli_rejects_too_short_signer_truncate() {
        let cli = Cli::parse_from(["pictor", "--secret", "1234", "--signer-truncate", "16"]);
        assert!(cli.apply(ServerConfig::default()).is_err());

        let cli = Cli::parse_from(["pictor", "--secret", "1234", "--signer-truncate", "40"]);
        assert!(cli.apply(ServerConfig::default()).is_ok());
    }

    #[test]
    fn test_build_service_requires_secret_or_unsafe() {
        let config = ServerConfig::default();
        assert!(build_service(&config).is_err());

        let mut config = ServerConfig::default();
        config.unsafe_mode = true;
        assert!(build_service(&config).is_ok());

        let mut config = ServerConfig::default();
        config.secret = Some("1234".to_string());
        assert!(build_service(&config).is_ok());
    }

    #[test]
    fn test_build_service_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::default();
        config.unsafe_mode = true;
        config.storage_dir = Some(dir.path().display().to_string());
        config.result_storage_dir = Some(dir.path().join("results").display().to_string());
        assert!(build_service(&config).is_ok());
    }
}
