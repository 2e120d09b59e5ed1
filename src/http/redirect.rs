//! Plaintext companion listener routes.
//!
//! With static certificates every GET/HEAD request is redirected (302) to the
//! https URL on the conventional port; any other method gets 400 and never
//! reaches the upstream. With ACME the HTTP-01 challenge path is served first
//! and everything else falls through to the same redirect.

use std::convert::Infallible;

use axum::extract::Request;
use axum::http::header::{HOST, LOCATION};
use axum::http::uri::Authority;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use const_format::formatcp;
use tower::Service;
use tower_http::trace::TraceLayer;

use crate::config::HTTPS_PORT;

/// Well-known path prefix for HTTP-01 challenge tokens
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge";

/// Route pattern for HTTP-01 challenge tokens
pub const ACME_CHALLENGE_ROUTE: &str = formatcp!("{}/{{challenge_token}}", ACME_CHALLENGE_PREFIX);

/// Companion router for the static-certificate source.
pub fn redirect_router() -> Router {
    Router::new()
        .fallback(redirect_to_https)
        .layer(TraceLayer::new_for_http())
}

/// Companion router for the ACME source.
///
/// `challenges` answers HTTP-01 challenge requests; it takes precedence over
/// the https redirect.
pub fn acme_companion_router<S>(challenges: S) -> Router
where
    S: Service<Request, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Response: IntoResponse,
    S::Future: Send + 'static,
{
    Router::new()
        .route_service(ACME_CHALLENGE_ROUTE, challenges)
        .fallback(redirect_to_https)
        .layer(TraceLayer::new_for_http())
}

async fn redirect_to_https(method: Method, headers: HeaderMap, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return (StatusCode::BAD_REQUEST, "Use HTTPS\n").into_response();
    }

    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| uri.authority().map(Authority::as_str));
    let Some(host) = host.filter(|h| !h.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing Host header\n").into_response();
    };

    let target = https_target(host, &uri);
    tracing::debug!(from = %uri, to = %target, "Redirecting HTTP to HTTPS");

    (StatusCode::FOUND, [(LOCATION, target)]).into_response()
}

/// Build the https URL for a plaintext request to `host` (the Host header).
///
/// An explicit port is rewritten to the HTTPS port; path and query are kept.
pub fn https_target(host: &str, uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("https://{}{}", secure_authority(host), path_and_query)
}

fn secure_authority(host: &str) -> String {
    match host.parse::<Authority>() {
        Ok(authority) if authority.port().is_some() => {
            format!("{}:{}", authority.host(), HTTPS_PORT)
        }
        _ => host.to_string(),
    }
}
