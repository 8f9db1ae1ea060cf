//! Per-domain pool of waiting tunnels: idle virtual-connection endpoints
//! whose streams are open but not yet dispatched to an HTTP request.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::DuplexStream;

use crate::error::{Result, TunnelError};

/// Per-domain cap on concurrent waiting tunnels, the same as Chrome's max
/// connections per site.
pub const MAX_WAITING: usize = 15;

static NEXT_TUNNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one waiting tunnel, used to remove it from the pool when its
/// bridge terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelId(u64);

impl TunnelId {
    pub fn next() -> Self {
        Self(NEXT_TUNNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct WaitingConn {
    pub id: TunnelId,
    pub conn: DuplexStream,
}

/// FIFO queue of waiting endpoints. Not internally synchronized: the owner
/// (the user record) guards it with its own lock, which is what makes the
/// capacity check atomic with the append.
#[derive(Default)]
pub struct WaitingPool {
    conns: VecDeque<WaitingConn>,
}

impl WaitingPool {
    /// Append at the tail, refusing once the pool is full.
    pub fn put(&mut self, conn: WaitingConn) -> Result<()> {
        if self.conns.len() >= MAX_WAITING {
            return Err(TunnelError::Capacity(MAX_WAITING));
        }
        self.conns.push_back(conn);
        Ok(())
    }

    /// Remove and return the head of the pool.
    pub fn take(&mut self) -> Result<WaitingConn> {
        self.conns.pop_front().ok_or(TunnelError::NoIdle)
    }

    /// Remove the endpoint with the given identity, if still present.
    pub fn remove(&mut self, id: TunnelId) {
        self.conns.retain(|waiting| waiting.id != id);
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }
}
