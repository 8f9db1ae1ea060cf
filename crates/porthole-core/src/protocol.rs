//! Wire surface shared by both endpoints of the tunnel service.

use serde::{Deserialize, Serialize};

/// Path of the unary registration endpoint.
pub const REGISTER_PATH: &str = "/register";
/// Path of the bidirectional tunnel endpoint (WebSocket upgrade).
pub const TUNNEL_PATH: &str = "/tunnel";

/// Upgrade request header carrying the registered domain.
pub const HOST_HEADER: &str = "x-porthole-host";
/// Upgrade request header carrying the bearer token.
pub const TOKEN_HEADER: &str = "x-porthole-token";
/// Registration request header advertising the client version.
pub const VERSION_HEADER: &str = "x-porthole-version";

/// Default port of the tunnel service.
pub const DEFAULT_TUNNEL_PORT: u16 = 49776;

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub domain: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub full_domain: String,
    pub token: String,
}
