use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use flate2::read::GzDecoder;

use crate::server::ServerState;

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Decodes a gzip-encoded request body in place. Grounded on the original's
/// `bodyMiddleWare`: a bad gzip header is a 400, not a 500.
pub async fn body_middleware(request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();
    let is_gzip = parts
        .headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        == Some("gzip");

    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let decoded = if is_gzip {
        let mut decoder = GzDecoder::new(&bytes[..]);
        let mut out = Vec::new();
        if decoder.read_to_end(&mut out).is_err() {
            return (StatusCode::BAD_REQUEST, "unable to decode gzip body").into_response();
        }
        out
    } else {
        bytes.to_vec()
    };

    parts.headers.remove(header::CONTENT_ENCODING);
    let request = Request::from_parts(parts, Body::from(decoded));
    next.run(request).await
}

/// Rejects write requests missing the `db` query parameter, and injects the
/// server's default retention policy when `rp` is absent, matching
/// `queryMiddleWare`.
pub async fn query_middleware(State(state): State<Arc<ServerState>>, mut request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let is_write_path = path == "/write" || path == "/api/v1/prom/write";

    let query = request.uri().query().unwrap_or("").to_string();
    let mut pairs: Vec<(String, String)> = url_decode_pairs(&query);

    let has_db = pairs.iter().any(|(k, _)| k == "db");
    if is_write_path && !has_db {
        return (StatusCode::BAD_REQUEST, "missing parameter: db").into_response();
    }

    if !pairs.iter().any(|(k, _)| k == "rp") {
        if let Some(rp) = &state.default_rp {
            pairs.push(("rp".to_string(), rp.clone()));
        }
    }

    let new_query = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    let mut uri_parts = request.uri().clone().into_parts();
    let path_and_query = if new_query.is_empty() {
        path.clone()
    } else {
        format!("{}?{}", path, new_query)
    };
    if let Ok(pq) = path_and_query.parse() {
        uri_parts.path_and_query = Some(pq);
        if let Ok(uri) = axum::http::Uri::from_parts(uri_parts) {
            *request.uri_mut() = uri;
        }
    }

    next.run(request).await
}

fn url_decode_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Logs path/remote-addr/elapsed after the inner handler completes, matching
/// `logMiddleWare`'s after-the-fact logging.
pub async fn log_middleware(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(request).await;
    tracing::info!(path = %path, status = %response.status(), elapsed_ms = start.elapsed().as_millis(), "handled request");
    response
}

/// Rejects requests once the server-level token bucket is exhausted.
pub async fn rate_middleware(State(state): State<Arc<ServerState>>, request: Request, next: Next) -> Response {
    if let Some(limiter) = &state.rate_limiter {
        if !limiter.allow() {
            return StatusCode::TOO_MANY_REQUESTS.into_response();
        }
    }
    next.run(request).await
}
