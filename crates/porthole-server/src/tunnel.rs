//! The tunnel service: unary registration plus the WebSocket endpoint a
//! client opens once per waiting tunnel.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use porthole_core::bridge::{self, run_bridge, PacketSink, PacketSource};
use porthole_core::protocol::{
    RegisterRequest, RegisterResponse, HOST_HEADER, REGISTER_PATH, TOKEN_HEADER, TUNNEL_PATH,
    VERSION_HEADER,
};
use porthole_core::registry::Registry;
use porthole_core::version::check_version_compatible;
use porthole_core::{Result, TunnelError};

pub(crate) fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route(REGISTER_PATH, post(register))
        .route(TUNNEL_PATH, get(create_tunnel))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

async fn register(
    State(registry): State<Arc<Registry>>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> std::result::Result<Json<RegisterResponse>, StatusCode> {
    if req.domain.is_empty() {
        warn!("registration rejected: empty domain");
        return Err(StatusCode::BAD_REQUEST);
    }

    if let Some(client_version) = header_str(&headers, VERSION_HEADER) {
        if !check_version_compatible(client_version).unwrap_or(false) {
            warn!(
                domain = %req.domain,
                client_version,
                "registration rejected: incompatible client version"
            );
            return Err(StatusCode::BAD_REQUEST);
        }
    }

    match registry.register(&req.domain) {
        Ok((full_domain, token)) => Ok(Json(RegisterResponse { full_domain, token })),
        Err(TunnelError::NameTaken(_)) => {
            warn!(domain = %req.domain, "registration rejected: domain unavailable");
            Err(StatusCode::CONFLICT)
        }
        Err(e) => {
            warn!(domain = %req.domain, "registration failed: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Accept one tunnel stream: authenticate the upgrade request, pool the
/// virtual-connection endpoint, then bridge packets until either side
/// terminates. The endpoint is pooled before the upgrade completes, so the
/// capacity verdict is part of the HTTP response.
async fn create_tunnel(
    State(registry): State<Arc<Registry>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let host = header_str(&headers, HOST_HEADER).unwrap_or_default().to_string();
    let token = header_str(&headers, TOKEN_HEADER).unwrap_or_default();

    if !registry.authenticate(&host, token) {
        warn!(host = %host, "tunnel rejected: valid token required");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let (p1, p2) = bridge::pipe();
    let id = match registry.put_waiting(&host, p2) {
        Ok(id) => id,
        Err(TunnelError::Capacity(max)) => {
            warn!(host = %host, max, "tunnel rejected: reached max waiting connections");
            return StatusCode::TOO_MANY_REQUESTS.into_response();
        }
        Err(e) => {
            warn!(host = %host, "tunnel rejected: {e}");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let failed_registry = registry.clone();
    let failed_host = host.clone();
    ws.on_failed_upgrade(move |e| {
        debug!(host = %failed_host, %id, "tunnel upgrade failed: {e}");
        failed_registry.remove_waiting(&failed_host, id);
    })
    .on_upgrade(move |socket| async move {
        debug!(host = %host, %id, "tunnel established");
        let (sink, stream) = socket.split();
        let mut tx = WsSink(sink);
        let mut rx = WsStream(stream);
        if let Err(e) = run_bridge(p1, &mut tx, &mut rx, None).await {
            debug!(host = %host, %id, "tunnel ended: {e}");
        }
        let _ = tx.0.close().await;
        registry.remove_waiting(&host, id);
        debug!(host = %host, %id, "tunnel closed");
    })
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

struct WsSink(SplitSink<WebSocket, Message>);

impl PacketSink for WsSink {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        self.0
            .send(Message::Binary(data))
            .await
            .map_err(|e| TunnelError::Transport(e.to_string()))
    }
}

struct WsStream(SplitStream<WebSocket>);

impl PacketSource for WsStream {
    async fn recv(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.0.next().await {
                None => return Ok(None),
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TunnelError::Transport(e.to_string())),
            }
        }
    }
}
