//! Accept queue for dispatched tunnels. There is no real socket to listen
//! on: a "connection" arrives when a waiting tunnel receives its first
//! packet, and with it the virtual-connection endpoint the local HTTP
//! server should read the request from.

use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use porthole_core::{Result, TunnelError};

pub struct TunnelListener {
    conns: mpsc::Receiver<DuplexStream>,
    shutdown: CancellationToken,
}

impl TunnelListener {
    pub fn new(conns: mpsc::Receiver<DuplexStream>, shutdown: CancellationToken) -> Self {
        Self { conns, shutdown }
    }

    /// Wait for the next dispatched tunnel. Fails with
    /// [`TunnelError::TunnelClosed`] once the listener is closed, for
    /// pending and future calls alike.
    pub async fn accept(&mut self) -> Result<DuplexStream> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TunnelError::TunnelClosed),
            conn = self.conns.recv() => {
                debug!("accepted dispatched tunnel");
                conn.ok_or(TunnelError::TunnelClosed)
            }
        }
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}
