//! Single-host reverse proxy.
//!
//! Every request accepted by the primary listener is forwarded to one upstream
//! URL. The request target is joined onto the upstream path, hop-by-hop
//! headers are dropped in both directions, the client's Host is kept, and the
//! client address is appended to `X-Forwarded-For`. Bodies are streamed.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::{Body, HttpBody};
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware;
use axum::response::Response;
use axum::Router;
use http::header::{CONNECTION, HOST};
use http::{HeaderMap, HeaderName, HeaderValue, Uri};
use reqwest::Url;

use crate::error::ProxyError;
use crate::middleware::request_id_layer;

/// `X-Forwarded-For` request header
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The upstream target and the client used to reach it.
#[derive(Debug, Clone)]
pub struct Upstream {
    target: Url,
    client: reqwest::Client,
}

impl Upstream {
    pub fn new(target: Url) -> Result<Self, reqwest::Error> {
        // Upstream redirects go back to the client untouched
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self { target, client })
    }

    /// Upstream URL for an incoming request target.
    pub fn url_for(&self, uri: &Uri) -> Url {
        let mut url = self.target.clone();
        url.set_path(&join_paths(self.target.path(), uri.path()));

        let base = self.target.query().filter(|q| !q.is_empty());
        let extra = uri.query().filter(|q| !q.is_empty());
        let query = match (base, extra) {
            (Some(base), Some(extra)) => Some(format!("{base}&{extra}")),
            (Some(q), None) | (None, Some(q)) => Some(q.to_string()),
            (None, None) => None,
        };
        url.set_query(query.as_deref());
        url
    }

    /// Forward `request` upstream and relay the response.
    pub async fn forward(
        &self,
        request: Request,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response, ProxyError> {
        let (parts, body) = request.into_parts();
        let url = self.url_for(&parts.uri);

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        if !headers.contains_key(HOST) {
            // HTTP/2 carries the host in the request target
            if let Some(value) = parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            {
                headers.insert(HOST, value);
            }
        }
        if let Some(addr) = client_addr {
            append_forwarded_for(&mut headers, addr.ip());
        }

        tracing::debug!(%url, "Forwarding request upstream");

        let mut outbound = self.client.request(parts.method, url).headers(headers);
        if body.size_hint().exact() != Some(0) {
            outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }
        let upstream = outbound.send().await?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Router that forwards every request to `upstream`.
pub fn router(upstream: Upstream) -> Router {
    Router::new()
        .fallback(forward)
        .with_state(Arc::new(upstream))
        .layer(middleware::from_fn(request_id_layer))
}

async fn forward(
    State(upstream): State<Arc<Upstream>>,
    request: Request,
) -> Result<Response, ProxyError> {
    let client_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    upstream.forward(request, client_addr).await
}

/// Join two URL paths with exactly one slash between them.
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    let value = if prior.is_empty() {
        ip.to_string()
    } else {
        format!("{}, {ip}", prior.join(", "))
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, StatusCode};
    use tower::ServiceExt;

    fn upstream(target: &str) -> Upstream {
        Upstream::new(Url::parse(target).unwrap()).unwrap()
    }

    // =============================================================================
    // URL mapping
    // =============================================================================

    #[test]
    fn test_url_for_root_target() {
        let up = upstream("http://127.0.0.1:9000");
        let url = up.url_for(&"/foo?x=1".parse().unwrap());
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/foo?x=1");
    }

    #[test]
    fn test_url_for_joins_base_path() {
        let up = upstream("http://backend/api/");
        assert_eq!(up.url_for(&"/v1/items".parse().unwrap()).path(), "/api/v1/items");

        let up = upstream("http://backend/api");
        assert_eq!(up.url_for(&"/v1/items".parse().unwrap()).path(), "/api/v1/items");
    }

    #[test]
    fn test_url_for_merges_queries() {
        let up = upstream("http://backend/?key=abc");
        assert_eq!(up.url_for(&"/s?q=1".parse().unwrap()).query(), Some("key=abc&q=1"));
        assert_eq!(up.url_for(&"/s".parse().unwrap()).query(), Some("key=abc"));

        let up = upstream("http://backend/");
        assert_eq!(up.url_for(&"/s".parse().unwrap()).query(), None);
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("/", "/foo"), "/foo");
        assert_eq!(join_paths("/a", "b"), "/a/b");
        assert_eq!(join_paths("/a/", "b"), "/a/b");
        assert_eq!(join_paths("/a", "/b"), "/a/b");
    }

    // =============================================================================
    // Header handling
    // =============================================================================

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-session-hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session-hint", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("x-kept", HeaderValue::from_static("yes"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["x-kept"], "yes");
    }

    #[test]
    fn test_append_forwarded_for() {
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, "10.0.0.1".parse().unwrap());
        assert_eq!(headers[&X_FORWARDED_FOR], "10.0.0.1");

        append_forwarded_for(&mut headers, "10.0.0.2".parse().unwrap());
        assert_eq!(headers[&X_FORWARDED_FOR], "10.0.0.1, 10.0.0.2");
    }

    // =============================================================================
    // Forwarding
    // =============================================================================

    async fn spawn_echo_upstream() -> SocketAddr {
        let app = Router::new().fallback(|request: Request| async move {
            let host = request.headers()[HOST].to_str().unwrap().to_string();
            let line = format!("{} {} host={}", request.method(), request.uri(), host);
            let body = axum::body::to_bytes(request.into_body(), 1 << 16).await.unwrap();
            (
                StatusCode::ACCEPTED,
                [("x-upstream", "echo"), ("connection", "close")],
                format!("{line} body={}", String::from_utf8_lossy(&body)),
            )
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    #[tokio::test]
    async fn test_router_forwards_request_and_response() {
        let addr = spawn_echo_upstream().await;
        let app = router(upstream(&format!("http://{addr}")));

        let request = Request::builder()
            .method(Method::PUT)
            .uri("/foo?x=1")
            .header(HOST, "front.example")
            .header("content-length", "5")
            .body(Body::from("hello"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()["x-upstream"], "echo");
        assert!(response.headers().get(CONNECTION).is_none());
        let body = axum::body::to_bytes(response.into_body(), 1 << 16).await.unwrap();
        assert_eq!(&body[..], b"PUT /foo?x=1 host=front.example body=hello");
    }

    #[tokio::test]
    async fn test_router_returns_bad_gateway_when_upstream_down() {
        // Reserve a port, then free it so nothing is listening
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let app = router(upstream(&format!("http://{addr}")));

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
