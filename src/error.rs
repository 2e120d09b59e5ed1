use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Per-request forwarding failure. Never fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Upstream(err) if err.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!(error = %self, status = status.as_u16(), "Proxy error");

        let reason = status.canonical_reason().unwrap_or("Gateway Error");
        (status, format!("{reason}\n")).into_response()
    }
}
