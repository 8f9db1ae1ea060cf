//! Tunnel multiplexing and connection brokerage shared by the porthole
//! server and client: packet framing over a message stream, the per-domain
//! pool of waiting tunnels, the user registry and its recycler.

pub mod bridge;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod recycle;
pub mod registry;
pub mod version;

pub use error::{Result, TunnelError};
