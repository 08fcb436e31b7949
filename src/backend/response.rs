use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

/// Response captured from a single backend request, stamped with enough
/// provenance (server/cluster/location) to debug which backend answered.
#[derive(Debug, Clone)]
pub struct ResponseData {
    pub server_id: String,
    pub cluster_id: String,
    pub location: String,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub status: StatusCode,
    pub body: Bytes,
}

impl ResponseData {
    pub fn new(server_id: impl Into<String>, cluster_id: impl Into<String>, location: impl Into<String>) -> Self {
        ResponseData {
            server_id: server_id.into(),
            cluster_id: cluster_id.into(),
            location: location.into(),
            content_type: None,
            content_encoding: None,
            status: StatusCode::OK,
            body: Bytes::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_client_error(&self) -> bool {
        self.status.is_client_error()
    }
}

impl IntoResponse for ResponseData {
    fn into_response(self) -> Response {
        let mut resp = Response::builder().status(self.status);
        if let Some(ct) = &self.content_type {
            if let Ok(v) = HeaderValue::from_str(ct) {
                resp = resp.header(axum::http::header::CONTENT_TYPE, v);
            }
        }
        if let Some(ce) = &self.content_encoding {
            if let Ok(v) = HeaderValue::from_str(ce) {
                resp = resp.header(axum::http::header::CONTENT_ENCODING, v);
            }
        }
        resp.body(axum::body::Body::from(self.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

/// Picks a single representative response out of a fanned-out batch: the
/// first 2xx if any, else the first 4xx, else the last response seen.
/// This resolves an ambiguity in the original multi-backend reducer, which
/// falls back to an arbitrary backend's response rather than reasoning
/// about status classes.
pub fn reduce_responses(responses: &[ResponseData]) -> Option<ResponseData> {
    if let Some(ok) = responses.iter().find(|r| r.is_success()) {
        return Some(ok.clone());
    }
    if let Some(client_err) = responses.iter().find(|r| r.is_client_error()) {
        return Some(client_err.clone());
    }
    responses.last().cloned()
}
