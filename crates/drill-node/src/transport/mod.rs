//! Node links: authenticated TCP sockets carrying framed commands.
//!
//! [`inbound::InboundTransport`] accepts links from other nodes and registers every authenticated
//! socket under the remote node id. [`outbound::OutboundTransport`] keeps a pool of links to one
//! configured node. Both hand every decoded command to the same [`CommandCallback`].

pub mod inbound;
pub mod outbound;
pub mod pool;
pub mod reader;
pub mod socket;
pub mod socket_data;
pub mod writer;

use drill_core::{Command, DrillError, DrillResult};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use reader::CommandReader;
use socket::NodeSocket;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// How long a new link may take to connect and finish its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a received command came from.
#[derive(Clone)]
pub struct TransportContext {
    /// Remote node id established by the handshake.
    pub node_id: Uuid,
    pub socket: Arc<NodeSocket>,
}

/// Receives every command read after a link's handshake.
///
/// The read loop awaits the returned future before reading the next command, so commands from
/// one socket are handled in order.
pub type CommandCallback =
    Arc<dyn Fn(Command, TransportContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Delivers a command to a node by id, over whichever link reaches it.
pub trait CommandSink: Send + Sync + 'static {
    fn write_command_to(&self, node_id: Uuid, command: Command) -> BoxFuture<'_, DrillResult<()>>;
}

/// Read commands from an authenticated link until it closes or fails, then destroy it.
pub(crate) async fn read_loop(
    socket: Arc<NodeSocket>,
    mut reader: CommandReader,
    node_id: Uuid,
    callback: CommandCallback,
) {
    let context = TransportContext {
        node_id,
        socket: socket.clone(),
    };
    {
        let commands = reader.commands();
        tokio::pin!(commands);

        loop {
            let next = tokio::select! {
                next = commands.next() => next,
                _ = socket.closed() => break,
            };
            match next {
                Some(Ok(command)) => {
                    trace!(
                        socket = socket.id(),
                        %node_id,
                        command = ?command.command_type(),
                        connection_id = ?command.connection_id(),
                        "command received"
                    );
                    callback(command, context.clone()).await;
                }
                Some(Err(DrillError::Closed)) | None => {
                    debug!(socket = socket.id(), %node_id, "node link closed");
                    break;
                }
                Some(Err(e)) => {
                    warn!(socket = socket.id(), %node_id, error = %e, "dropping node link");
                    break;
                }
            }
        }
    }

    let unread = reader.pending();
    if unread > 0 {
        debug!(socket = socket.id(), %node_id, unread, "node link dropped with a partial frame");
    }
    socket.destroy().await;
}
