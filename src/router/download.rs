//! `/download/{hash}` and `/measure/{n}` handlers (spec.md §4.7), ported
//! from `original_source/handler.go:handleDownload`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::hashes::{is_empty_hash, is_hex};
use crate::storage::ServeOutcome;

use super::signature::check_query_sign;
use super::RouterState;

/// Cache-Control applied to empty-hash responses: they never change, so
/// clients (and any fronting cache) may keep them forever.
pub const EMPTY_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

#[derive(Deserialize)]
pub struct DownloadQuery {
    pub s: Option<String>,
    pub e: Option<String>,
    pub name: Option<String>,
}

fn host_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_ascii_lowercase())
        .unwrap_or_default()
}

pub async fn handle_download(
    State(state): State<Arc<RouterState>>,
    Path(hash): Path<String>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Response {
    let host = host_from_headers(&headers);
    let Some(sub) = state.find_by_host(&host) else {
        return (StatusCode::FORBIDDEN, "Unexpected hostname").into_response();
    };

    if !is_hex(&hash) {
        return (StatusCode::NOT_FOUND, format!("{hash} is not a valid hash")).into_response();
    }

    if !state.skip_signature_check
        && check_query_sign(&sub.identity.secret, &hash, query.s.as_deref(), query.e.as_deref())
            .is_err()
    {
        return (StatusCode::FORBIDDEN, "Cannot verify signature").into_response();
    }

    if !sub.state_machine.is_enabled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Cluster is not enabled yet").into_response();
    }

    if is_empty_hash(&hash) {
        return serve_empty_hash(&hash, query.name.as_deref());
    }

    let size = match sub.manifest.size_of(&hash).await {
        Some(size) => size,
        None => match sub.manifest.force_fetch(&hash).await {
            Ok(size) => size,
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("cannot fetch file from center server: {e}"),
                )
                    .into_response()
            }
        },
    };

    let mut buf: Vec<u8> = Vec::new();
    match sub.storage.serve(&mut buf, &hash, size).await {
        Ok(ServeOutcome::Served { bytes }) => {
            state.stats.record_hit(1, bytes, &sub.identity.id);
            sub.state_machine.record_hit(bytes, true);
            let mut response = Response::new(Body::from(buf));
            if let Ok(value) = HeaderValue::from_str(&hash) {
                response.headers_mut().insert("X-Bmclapi-Hash", value);
            }
            response
        }
        Ok(ServeOutcome::Redirect { location }) => {
            state.stats.record_hit(1, size, &sub.identity.id);
            sub.state_machine.record_hit(size, true);
            let mut response = StatusCode::FOUND.into_response();
            if let Ok(value) = HeaderValue::from_str(&location) {
                response.headers_mut().insert(header::LOCATION, value);
            }
            response
        }
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

/// The two well-known empty-file hashes are served directly: zero bytes,
/// tagged with an ETag and an immutable Cache-Control, with an optional
/// `Content-Disposition` derived from the `name=` query parameter
/// (`handler.go:handleDownload`'s empty-hash special case).
fn serve_empty_hash(hash: &str, name: Option<&str>) -> Response {
    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(hash) {
        headers.insert("X-Bmclapi-Hash", value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("\"{hash}\"")) {
        headers.insert(header::ETAG, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(EMPTY_CACHE_CONTROL));
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    if let Some(name) = name {
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{name}\"")) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
    response
}

pub async fn handle_measure(
    State(state): State<Arc<RouterState>>,
    Path(size_mb): Path<u32>,
    Query(query): Query<HashMap<String, String>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let host = host_from_headers(&headers);
    let Some(sub) = state.find_by_host(&host) else {
        return (StatusCode::FORBIDDEN, "Unexpected hostname").into_response();
    };

    if !state.skip_signature_check {
        let s = query.get("s").map(String::as_str);
        let e = query.get("e").map(String::as_str);
        if check_query_sign(&sub.identity.secret, uri.path(), s, e).is_err() {
            return (StatusCode::FORBIDDEN, "Cannot verify signature").into_response();
        }
    }

    if size_mb > 200 {
        return (
            StatusCode::BAD_REQUEST,
            format!("measure size {size_mb} out of range [0, 200]"),
        )
            .into_response();
    }

    let mut buf = Vec::new();
    match sub.storage.measure(&mut buf, size_mb).await {
        Ok(_) => Response::new(Body::from(buf)),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_robots() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain")], super::ROBOTS_TXT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_hash_response_carries_immutable_cache_control() {
        let response = serve_empty_hash("d41d8cd98f00b204e9800998ecf8427e", Some("file.bin"));
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            EMPTY_CACHE_CONTROL,
        );
        assert_eq!(
            response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"file.bin\"",
        );
    }

    #[test]
    fn empty_hash_response_without_name_has_no_disposition() {
        let response = serve_empty_hash("d41d8cd98f00b204e9800998ecf8427e", None);
        assert!(response.headers().get(header::CONTENT_DISPOSITION).is_none());
    }
}
