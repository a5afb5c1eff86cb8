//! HTTP-level cross-cutting concerns: the pre-dispatch host redirect and
//! the access-log timing wrapper (spec.md §4.7 plus SPEC_FULL.md §10
//! "Host-redirect ordering" / "Access-log record pair").

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::RouterState;

/// Redirects a client connecting on an unrecognized hostname to the first
/// concrete `public_hosts` entry, before any path dispatch
/// (`handler.go:ServeHTTP`, "redirect the client to the first public host
/// if it's connecting with an unexpected host"). A no-op once the Host
/// header matches a known sub-cluster, or when disabled by configuration.
pub async fn host_redirect(
    State(state): State<Arc<RouterState>>,
    request: Request,
    next: Next,
) -> Response {
    if state.redirect_https {
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h).to_ascii_lowercase());

        if let Some(host) = host {
            if state.find_by_host(&host).is_none() {
                if let Some(target) = state.first_concrete_host() {
                    let location =
                        format!("https://{}:{}{}", target, state.public_port, request.uri());
                    if let Ok(value) = HeaderValue::from_str(&location) {
                        let mut response = StatusCode::FOUND.into_response();
                        response.headers_mut().insert(header::LOCATION, value);
                        return response;
                    }
                }
            }
        }
    }
    next.run(request).await
}

/// Times the request, tags the response with `X-Powered-By`, and hands a
/// summary to the [`crate::stats::access_log::AccessLogger`]
/// (`handler.go:createRecordMiddleWare`).
pub async fn access_log(
    State(state): State<Arc<RouterState>>,
    request: Request,
    next: Next,
) -> Response {
    let ua = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let is_download = request.uri().path().starts_with("/download/");
    let skip_ua = request
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(super::range::should_skip_ua_count)
        .unwrap_or(false);

    let start = Instant::now();
    let mut response = next.run(request).await;
    let elapsed = start.elapsed().as_secs_f64();

    if let Ok(value) = HeaderValue::from_str(super::X_POWERED_BY) {
        response.headers_mut().insert("X-Powered-By", value);
    }

    if is_download && response.status().is_success() {
        let bytes = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        state.access_log.submit(elapsed, bytes, &ua, skip_ua);
    }

    response
}
