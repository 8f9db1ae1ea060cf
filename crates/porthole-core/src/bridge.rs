//! Framing bridge: copies bytes between one end of an in-memory pipe and a
//! message-oriented packet stream, in both directions.
//!
//! The packet stream is expressed as a capability pair ([`PacketSink`],
//! [`PacketSource`]) rather than a concrete transport type, so the bridge
//! can be exercised against in-memory fakes.

use std::future::Future;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Result, TunnelError};

/// Largest payload carried by a single packet.
pub const MAX_PACKET: usize = 32 * 1024;

/// Outgoing half of a packet stream.
pub trait PacketSink: Send {
    fn send(&mut self, data: Bytes) -> impl Future<Output = Result<()>> + Send;
}

/// Incoming half of a packet stream. `Ok(None)` is a clean end-of-stream.
pub trait PacketSource: Send {
    fn recv(&mut self) -> impl Future<Output = Result<Option<Bytes>>> + Send;
}

/// Create the two endpoints of a virtual connection. The first is owned by
/// the bridge, the second is handed to HTTP code as an ordinary socket.
pub fn pipe() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(MAX_PACKET)
}

/// Hands the HTTP-side endpoint of a tunnel to an accept queue the moment
/// the first packet arrives, which is the signal that the server has taken
/// this tunnel out of the waiting pool to dispatch a request through it.
pub struct AcceptSignal {
    queue: mpsc::Sender<DuplexStream>,
    conn: DuplexStream,
}

impl AcceptSignal {
    pub fn new(queue: mpsc::Sender<DuplexStream>, conn: DuplexStream) -> Self {
        Self { queue, conn }
    }

    async fn deliver(self) -> Result<()> {
        self.queue
            .send(self.conn)
            .await
            .map_err(|_| TunnelError::TunnelClosed)
    }
}

/// Run both directions of the bridge until one of them terminates, and
/// return that direction's result. Returning drops the pipe halves, so the
/// peer endpoint observes EOF once buffered bytes are drained.
pub async fn run_bridge<Tx, Rx>(
    pipe: DuplexStream,
    tx: &mut Tx,
    rx: &mut Rx,
    accept: Option<AcceptSignal>,
) -> Result<()>
where
    Tx: PacketSink,
    Rx: PacketSource,
{
    let (rd, wr) = tokio::io::split(pipe);
    tokio::select! {
        res = recv_loop(rx, wr, accept) => res,
        res = send_loop(rd, tx) => res,
    }
}

/// Stream → pipe. Empty packets are legal on the wire and skipped; a short
/// write into the pipe is fatal (`write_all` turns it into an error).
async fn recv_loop<Rx: PacketSource>(
    rx: &mut Rx,
    mut pipe: WriteHalf<DuplexStream>,
    mut accept: Option<AcceptSignal>,
) -> Result<()> {
    loop {
        let packet = match rx.recv().await? {
            Some(data) => data,
            None => return Ok(()),
        };
        if let Some(signal) = accept.take() {
            signal.deliver().await?;
        }
        trace!(len = packet.len(), "received packet");
        if packet.is_empty() {
            continue;
        }
        pipe.write_all(&packet).await?;
    }
}

/// Pipe → stream. EOF on the pipe ends the direction cleanly.
async fn send_loop<Tx: PacketSink>(mut pipe: ReadHalf<DuplexStream>, tx: &mut Tx) -> Result<()> {
    let mut buf = vec![0u8; MAX_PACKET];
    loop {
        let nr = pipe.read(&mut buf).await?;
        if nr == 0 {
            return Ok(());
        }
        trace!(len = nr, "sending packet");
        tx.send(Bytes::copy_from_slice(&buf[..nr])).await?;
    }
}
