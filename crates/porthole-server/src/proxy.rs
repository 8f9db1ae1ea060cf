//! Public HTTP ingress: every inbound request is reverse-proxied to the
//! client that registered the request's `Host`, over a waiting tunnel.
//!
//! The proxy's HTTP client never dials TCP. Its connector asks the
//! registry for an idle virtual connection and hands that to hyper as the
//! transport socket, the pooled-connection equivalent of a dial.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header, uri::Uri, Request, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::DuplexStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use porthole_core::registry::Registry;
use porthole_core::TunnelError;

/// Idle virtual connections stay usable for follow-up requests to the same
/// host for this long before hyper drops them.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

pub(crate) fn router(registry: Arc<Registry>) -> Router {
    let client = HyperClient::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build(TunnelConnector { registry });
    Router::new()
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(ProxyState { client })
}

#[derive(Clone)]
pub(crate) struct ProxyState {
    client: HyperClient<TunnelConnector, Body>,
}

/// Forward one inbound request through a waiting tunnel. The upstream URI
/// keeps the incoming `Host` as its authority with scheme `http` and the
/// path untouched; resolution to an actual tunnel happens in the
/// connector.
async fn proxy_handler(
    State(state): State<ProxyState>,
    req: Request<Body>,
) -> std::result::Result<Response, StatusCode> {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let target_uri: Uri = format!("http://{host}{path_and_query}")
        .parse()
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let (mut parts, body) = req.into_parts();
    parts.uri = target_uri;

    // hop-by-hop headers stop here; Host stays, the upstream sees it
    for name in &[
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
    ] {
        parts.headers.remove(name);
    }
    parts.headers.remove("keep-alive");

    let proxy_req = Request::from_parts(parts, body);

    let resp = state.client.request(proxy_req).await.map_err(|e| {
        warn!(host = %host, "proxy error: {e}");
        StatusCode::BAD_GATEWAY
    })?;

    Ok(resp.into_response())
}

/// Connector that resolves a URI to a waiting tunnel of the registered
/// host, in place of a TCP dial.
#[derive(Clone)]
pub(crate) struct TunnelConnector {
    registry: Arc<Registry>,
}

impl tower::Service<Uri> for TunnelConnector {
    type Response = TunnelIo;
    type Error = TunnelError;
    type Future = Pin<Box<dyn Future<Output = Result<TunnelIo, TunnelError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let registry = self.registry.clone();
        Box::pin(async move {
            let host = uri
                .host()
                .ok_or_else(|| TunnelError::Config(format!("no host in {uri}")))?;
            let conn = registry.get_idle(host).map_err(|e| {
                debug!(host = %host, "tunnel not found");
                e
            })?;
            Ok(TunnelIo::new(conn))
        })
    }
}

/// A dispatched virtual connection, dressed up as a hyper transport.
pub(crate) struct TunnelIo {
    inner: TokioIo<DuplexStream>,
}

impl TunnelIo {
    fn new(conn: DuplexStream) -> Self {
        Self {
            inner: TokioIo::new(conn),
        }
    }
}

impl Connection for TunnelIo {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl hyper::rt::Read for TunnelIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for TunnelIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
