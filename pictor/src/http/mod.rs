//! HTTP entry point.
//!
//! Shapes the service into an axum router: GET/HEAD on any path, the
//! version/redirect base route, the `params/` echo endpoint, signature
//! enforcement, the request timeout, and response headers (Content-Type,
//! Content-Length, Cache-Control, Expires, ETag).
//!
//! Client disconnect is modelled by a [`CancellationToken`] carried in the
//! request extensions; a cancelled request answers 499 with an empty body
//! while the pipeline's detached work keeps running.

mod headers;

use crate::blob::Blob;
use crate::error::Error;
use crate::service::Service;
use crate::VERSION;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use futures::FutureExt;
use http::header::{
    CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, ETAG, EXPIRES, IF_NONE_MATCH, LOCATION, PRAGMA,
};
use http::request::Parts;
use http::{Method, StatusCode};
use std::panic::AssertUnwindSafe;
use tokio::time::timeout;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use headers::{error_cache_control, expires_now, no_cache_headers, success_cache_control};

/// Builds the HTTP router over a service.
pub fn router(service: Service) -> Router {
    Router::new().fallback(handle).with_state(service)
}

async fn handle(State(service): State<Service>, req: Request) -> Response {
    let cancel = req
        .extensions()
        .get::<CancellationToken>()
        .cloned()
        .unwrap_or_default();
    let method = req.method().clone();
    if method != Method::GET && method != Method::HEAD {
        return plain_status(StatusCode::METHOD_NOT_ALLOWED);
    }

    let (parts, _body) = req.into_parts();
    let path = parts.uri.path().to_string();

    if path == "/" || path.is_empty() {
        return base_route(&service);
    }
    let trimmed = path.trim_start_matches('/');
    if trimmed.starts_with("params/") {
        return params_route(&service, trimmed, &method);
    }

    let accept = parts
        .headers
        .get(http::header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let params = match service.request_params(&path, accept.as_deref()) {
        Ok(params) => params,
        Err(e) => return error_response(&service, e, &method),
    };

    let request_timeout = service.inner.settings.request_timeout;
    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        bounded = timeout(
            request_timeout,
            AssertUnwindSafe(service.serve(&parts, &params, &cancel)).catch_unwind(),
        ) => match bounded {
            Err(_) => Err(Error::Timeout),
            Ok(Err(panic)) => {
                let message = panic_message(panic);
                error!(message = %message, "pipeline panicked");
                Err(Error::internal(message))
            }
            Ok(Ok(result)) => result,
        },
    };

    match outcome {
        Ok(blob) => blob_response(&service, blob, &parts, &method).await,
        Err(e) => error_response(&service, e, &method),
    }
}

/// `/` answers the version document, or redirects when configured.
fn base_route(service: &Service) -> Response {
    if let Some(url) = &service.inner.settings.base_path_redirect {
        return Response::builder()
            .status(StatusCode::TEMPORARY_REDIRECT)
            .header(LOCATION, url.as_str())
            .body(Body::empty())
            .unwrap_or_else(|_| plain_status(StatusCode::INTERNAL_SERVER_ERROR));
    }
    let body = serde_json::json!({"pictor": {"version": VERSION}}).to_string();
    json_response(StatusCode::OK, body)
}

/// `params/<rest>` echoes the parse result as pretty JSON. The signature
/// is not enforced here; the echoed `hash` field exposes what was parsed.
fn params_route(service: &Service, trimmed_path: &str, method: &Method) -> Response {
    if service.inner.settings.disable_params_endpoint {
        return plain_status(StatusCode::OK);
    }
    let params = crate::urlpath::parse(trimmed_path);
    let body = match serde_json::to_string_pretty(&params) {
        Ok(body) => body,
        Err(e) => return error_response(service, Error::internal(e.to_string()), method),
    };
    if method == Method::HEAD {
        return plain_status(StatusCode::OK);
    }
    json_response(StatusCode::OK, body)
}

async fn blob_response(service: &Service, blob: Blob, parts: &Parts, method: &Method) -> Response {
    let settings = &service.inner.settings;

    if let Some(attached) = blob.attached_error() {
        // diagnostic payload served under the attached error's status
        let status =
            StatusCode::from_u16(attached.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let content_type = blob.content_type().await;
        let bytes = match blob.bytes().await {
            Ok(bytes) => bytes,
            Err(_) => return error_response(service, attached.clone(), method),
        };
        let mut builder = Response::builder()
            .status(status)
            .header(CONTENT_TYPE, content_type);
        builder = apply_cache_headers(builder, settings, Some(status));
        let body = if method == Method::HEAD {
            builder = builder.header(CONTENT_LENGTH, bytes.len());
            Body::empty()
        } else {
            Body::from(bytes)
        };
        return builder
            .body(body)
            .unwrap_or_else(|_| plain_status(StatusCode::INTERNAL_SERVER_ERROR));
    }

    let content_type = blob.content_type().await;
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type);
    builder = apply_cache_headers(builder, settings, None);

    if settings.enable_etag || method == Method::HEAD {
        let bytes = match blob.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return error_response(service, e, method),
        };
        if settings.enable_etag {
            let etag = headers::etag(&bytes);
            if if_none_match(parts, &etag) {
                debug!(etag = %etag, "etag matched, not modified");
                return builder
                    .status(StatusCode::NOT_MODIFIED)
                    .header(ETAG, etag)
                    .body(Body::empty())
                    .unwrap_or_else(|_| plain_status(StatusCode::NOT_MODIFIED));
            }
            builder = builder.header(ETAG, etag);
        }
        builder = builder.header(CONTENT_LENGTH, bytes.len());
        let body = if method == Method::HEAD {
            Body::empty()
        } else {
            Body::from(bytes)
        };
        return builder
            .body(body)
            .unwrap_or_else(|_| plain_status(StatusCode::INTERNAL_SERVER_ERROR));
    }

    // streaming path: no etag requested, body flows straight through
    match blob.reader().await {
        Ok((reader, size)) => {
            if size > 0 {
                builder = builder.header(CONTENT_LENGTH, size);
            }
            builder
                .body(Body::from_stream(ReaderStream::new(reader)))
                .unwrap_or_else(|_| plain_status(StatusCode::INTERNAL_SERVER_ERROR))
        }
        Err(e) => error_response(service, e, method),
    }
}

fn error_response(service: &Service, error: Error, method: &Method) -> Response {
    let settings = &service.inner.settings;
    let status = StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    // a vanished client gets no body and no cache metadata
    if error == Error::Cancelled {
        return plain_status(status);
    }

    let mut builder = Response::builder().status(status);
    builder = apply_cache_headers(builder, settings, Some(status));
    if settings.disable_error_body || method == Method::HEAD {
        return builder
            .body(Body::empty())
            .unwrap_or_else(|_| plain_status(status));
    }
    builder
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(error.to_body()))
        .unwrap_or_else(|_| plain_status(status))
}

/// Applies the cache header policy: the no-cache override, the short
/// error-response cache, or the success TTL/SWR headers.
fn apply_cache_headers(
    mut builder: http::response::Builder,
    settings: &crate::service::Settings,
    error_status: Option<StatusCode>,
) -> http::response::Builder {
    if settings.cache_header_no_cache {
        let (cache_control, pragma) = no_cache_headers();
        return builder
            .header(CACHE_CONTROL, cache_control)
            .header(PRAGMA, pragma)
            .header(EXPIRES, expires_now());
    }
    match error_status {
        Some(status) => builder = builder.header(CACHE_CONTROL, error_cache_control(status)),
        None => {
            builder = builder.header(
                CACHE_CONTROL,
                success_cache_control(settings.cache_header_ttl, settings.cache_header_swr),
            )
        }
    }
    builder
}

fn if_none_match(parts: &Parts, etag: &str) -> bool {
    parts
        .headers
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(',').any(|candidate| candidate.trim() == etag))
        .unwrap_or(false)
}

fn json_response(status: StatusCode, body: String) -> Response {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| plain_status(StatusCode::INTERNAL_SERVER_ERROR))
}

fn plain_status(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic in pipeline".to_string()
    }
}
