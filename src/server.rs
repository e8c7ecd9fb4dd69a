//! HTTP gateway: one axum handler mapping every GET path into the proxy.
//!
//! Deliberately thin. The gateway owns exactly three jobs:
//!
//! - derive the cache key from the request (the raw path — query strings
//!   are not part of a derived image's identity),
//! - parse `If-Modified-Since` into a timestamp for the pipeline,
//! - translate the pipeline outcome into status, headers, and body.
//!
//! Success responses carry `Content-Type`, `Cache-Control`, and
//! `Last-Modified`. Everything else — errors and 304s alike — is a bare
//! status with no entity headers and no body.

use crate::pipeline::{Proxy, ResponseBody, ServeError, ServedImage};
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use futures_util::stream;
use std::sync::Arc;
use tracing::{debug, warn};

/// Build the router. Every path falls through to the image handler.
pub fn router(proxy: Arc<Proxy>) -> Router {
    Router::new().fallback(serve_image).with_state(proxy)
}

async fn serve_image(
    State(proxy): State<Arc<Proxy>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let path = uri.path();
    let modified_since = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok());

    match proxy.handle(path, modified_since).await {
        Ok(served) => {
            debug!(path, "serving image");
            success_response(served)
        }
        Err(err) => {
            match &err {
                ServeError::Upstream(e) => warn!(path, error = %e, "request failed"),
                other => debug!(path, status = other.status(), "request short-circuited"),
            }
            error_response(&err)
        }
    }
}

/// Non-200 outcomes (304 included) are a bare status: no entity headers,
/// no body.
fn error_response(err: &ServeError) -> Response {
    StatusCode::from_u16(err.status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        .into_response()
}

fn success_response(served: ServedImage) -> Response {
    let body = match served.body {
        ResponseBody::Full(bytes) => Body::from(bytes),
        ResponseBody::Stream(rx) => Body::from_stream(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })),
    };

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(served.content_type),
    );
    if let Ok(value) = HeaderValue::from_str(&served.cache_control) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(served.last_modified)) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    response
}
