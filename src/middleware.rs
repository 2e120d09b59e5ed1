//! Request span middleware for the forwarding listener.
//!
//! Each forwarded request gets a UUID v4 and an `info` span carrying the
//! request id, method, host, path and client address, so upstream errors can
//! be correlated with the request that caused them. The id stays local to
//! the proxy and is not sent upstream.

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request},
    http::header::HOST,
    middleware::Next,
    response::Response,
};
use tracing::Instrument;
use uuid::Uuid;

/// Request id, available to handlers through request extensions.
#[derive(Clone, Copy, Debug)]
pub struct RequestId(pub Uuid);

pub async fn request_id_layer(mut request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4();
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    let host = request
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        host = %host,
        path = %request.uri().path(),
        client = %client,
    );
    request.extensions_mut().insert(RequestId(request_id));

    let start = Instant::now();
    async move {
        let response = next.run(request).await;
        let status = response.status();
        let duration_ms = start.elapsed().as_millis() as u64;

        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), duration_ms, "Request completed");
        } else {
            tracing::info!(status = status.as_u16(), duration_ms, "Request completed");
        }
        response
    }
    .instrument(span)
    .await
}
