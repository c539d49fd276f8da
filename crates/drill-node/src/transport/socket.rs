//! One TCP link to another node.
//!
//! The write half sits behind a fair async mutex so concurrent writers never interleave frames and
//! writes go out in call order. The read half is handed out once, as a [`CommandReader`], to
//! whichever task drives the link's read loop.

use super::reader::CommandReader;
use super::writer::CommandWriter;
use drill_core::{Command, DrillError, DrillResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::debug;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

pub struct NodeSocket {
    id: u64,
    peer_addr: SocketAddr,
    writer: Mutex<CommandWriter<OwnedWriteHalf>>,
    closed: watch::Sender<bool>,
}

impl NodeSocket {
    /// Split `stream` into a shared socket handle and its command reader.
    pub fn new(stream: TcpStream) -> DrillResult<(Arc<Self>, CommandReader)> {
        let peer_addr = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let socket = Arc::new(Self {
            id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            writer: Mutex::new(CommandWriter::new(write_half)),
            closed: watch::Sender::new(false),
        });
        Ok((socket, CommandReader::new(read_half)))
    }

    /// Process-unique id, for logs and registry bookkeeping.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn write_command(&self, command: &Command) -> DrillResult<()> {
        if self.is_closed() {
            return Err(DrillError::Closed);
        }
        let mut writer = self.writer.lock().await;
        let result = writer.write_command(command).await;
        if result.is_err() {
            drop(writer);
            self.mark_closed();
        }
        result
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the socket is destroyed or a write on it has failed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Close the socket. The read loop observes it through [`NodeSocket::closed`].
    pub async fn destroy(&self) {
        if !self.mark_closed() {
            return;
        }
        debug!(socket = self.id, peer = %self.peer_addr, "node socket destroyed");
        // A writer stuck on a full send buffer keeps the lock; it fails on its own once the
        // read loop drops the reader and the peer resets.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.shutdown().await;
        }
    }

    /// Returns `true` if this call flipped the socket to closed.
    fn mark_closed(&self) -> bool {
        !self.closed.send_replace(true)
    }
}
