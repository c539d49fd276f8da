//! Bidirectional relay between a local TCP socket and a node link.

use crate::transport::socket_data::SocketData;
use crate::transport::CommandSink;
use drill_core::Command;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Handles a forwarder keeps for one relayed connection.
pub(super) struct RelayHandle {
    /// Bytes from the node link, to be written to the local socket.
    pub write_tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Sending (or dropping) stops the relay without notifying the remote node.
    pub cancel_tx: mpsc::Sender<()>,
}

impl RelayHandle {
    pub fn channel() -> (Self, RelayChannels) {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        (
            Self {
                write_tx,
                cancel_tx,
            },
            RelayChannels {
                write_rx,
                cancel_rx,
            },
        )
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.try_send(());
    }
}

pub(super) struct RelayChannels {
    pub write_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pub cancel_rx: mpsc::Receiver<()>,
}

/// What the relay forwards and to whom.
pub(super) struct Relay {
    pub connection_id: Uuid,
    pub node_id: Uuid,
    pub port: u16,
    pub sink: Arc<dyn CommandSink>,
    /// Re-send `EstablishConnection` at this period while the relay runs.
    pub keepalive: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RelayEnd {
    /// The local socket closed; the remote node was told.
    LocalClosed,
    /// Stopped through the handle: remote close or lease expiry.
    Cancelled,
    /// The node link rejected our data.
    SendFailed,
}

impl Relay {
    /// Pump data both ways until one side ends. The local socket is closed on return.
    pub async fn run(&self, stream: TcpStream, channels: RelayChannels) -> RelayEnd {
        let RelayChannels {
            mut write_rx,
            mut cancel_rx,
        } = channels;
        let (read_half, mut write_half) = stream.into_split();
        let mut data = SocketData::new(read_half);
        let mut keepalive = self.keepalive.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let end = loop {
            tokio::select! {
                _ = cancel_rx.recv() => break RelayEnd::Cancelled,
                chunk = data.next() => match chunk {
                    Some(chunk) => {
                        trace!(connection_id = %self.connection_id, bytes = chunk.len(), "local -> node");
                        let command = Command::send_data(self.connection_id, chunk);
                        if let Err(e) = self.sink.write_command_to(self.node_id, command).await {
                            warn!(connection_id = %self.connection_id, node_id = %self.node_id, error = %e, "failed to forward data, dropping connection");
                            break RelayEnd::SendFailed;
                        }
                    }
                    None => break RelayEnd::LocalClosed,
                },
                Some(bytes) = write_rx.recv() => {
                    trace!(connection_id = %self.connection_id, bytes = bytes.len(), "node -> local");
                    if let Err(e) = write_half.write_all(&bytes).await {
                        debug!(connection_id = %self.connection_id, error = %e, "local write failed");
                        break RelayEnd::LocalClosed;
                    }
                }
                _ = tick(&mut keepalive) => {
                    let command = Command::establish_connection(self.connection_id, self.port);
                    if let Err(e) = self.sink.write_command_to(self.node_id, command).await {
                        debug!(connection_id = %self.connection_id, error = %e, "establish keep-alive failed");
                    }
                }
            }
        };

        let _ = write_half.shutdown().await;
        if end == RelayEnd::LocalClosed {
            self.send_close().await;
        }
        end
    }

    /// Tell the remote node the connection is gone. Best effort.
    pub async fn send_close(&self) {
        let command = Command::close_connection(self.connection_id, self.port);
        if let Err(e) = self.sink.write_command_to(self.node_id, command).await {
            debug!(connection_id = %self.connection_id, error = %e, "close notification failed");
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Connections keyed by id, shared by a forwarder and its relay tasks.
pub(super) type ConnectionMap<T> = Arc<Mutex<HashMap<Uuid, T>>>;


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use tokio::io::AsyncReadExt;

    fn relay(sink: Arc<dyn CommandSink>, keepalive: Option<Duration>) -> Relay {
        Relay {
            connection_id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            port: 4242,
            sink,
            keepalive,
        }
    }

    #[tokio::test]
    async fn local_bytes_become_send_data() {
        let (sink, mut sent) = RecordingSink::new();
        let relay = relay(sink, None);
        let (mut local, relayed) = tcp_pair().await;
        let (_handle, channels) = RelayHandle::channel();

        let connection_id = relay.connection_id;
        let node_id = relay.node_id;
        let task = tokio::spawn(async move { relay.run(relayed, channels).await });

        let payload = noise(5000, 7);
        local.write_all(&payload).await.unwrap();
        local.shutdown().await.unwrap();

        let mut received = Vec::new();
        loop {
            let (to, command) = sent.recv().await.unwrap();
            assert_eq!(to, node_id);
            match command {
                Command::SendData { connection_id: id, data } => {
                    assert_eq!(id, connection_id);
                    received.extend(data);
                }
                Command::CloseConnection { connection_id: id, port } => {
                    assert_eq!(id, connection_id);
                    assert_eq!(port, 4242);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(received, payload);
        assert_eq!(task.await.unwrap(), RelayEnd::LocalClosed);
    }

    #[tokio::test]
    async fn written_bytes_reach_local_socket() {
        let (sink, _sent) = RecordingSink::new();
        let relay = relay(sink, None);
        let (mut local, relayed) = tcp_pair().await;
        let (handle, channels) = RelayHandle::channel();
        let task = tokio::spawn(async move { relay.run(relayed, channels).await });

        let payload = noise(5000, 11);
        for chunk in payload.chunks(1000) {
            handle.write_tx.send(chunk.to_vec()).unwrap();
        }
        let mut received = vec![0u8; payload.len()];
        local.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);

        handle.cancel();
        assert_eq!(task.await.unwrap(), RelayEnd::Cancelled);
        // Cancel closes the local socket.
        assert_eq!(local.read(&mut [0u8; 1]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancel_does_not_notify_remote() {
        let (sink, mut sent) = RecordingSink::new();
        let relay = relay(sink, None);
        let (_local, relayed) = tcp_pair().await;
        let (handle, channels) = RelayHandle::channel();
        let task = tokio::spawn(async move { relay.run(relayed, channels).await });

        drop(handle);
        assert_eq!(task.await.unwrap(), RelayEnd::Cancelled);
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_failure_drops_connection() {
        let relay = relay(RecordingSink::failing(), None);
        let (mut local, relayed) = tcp_pair().await;
        let (_handle, channels) = RelayHandle::channel();
        let task = tokio::spawn(async move { relay.run(relayed, channels).await });

        local.write_all(b"hello").await.unwrap();
        assert_eq!(task.await.unwrap(), RelayEnd::SendFailed);
        assert_eq!(local.read(&mut [0u8; 1]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn keepalive_resends_establish() {
        let (sink, mut sent) = RecordingSink::new();
        let relay = relay(sink, Some(Duration::from_millis(30)));
        let connection_id = relay.connection_id;
        let (_local, relayed) = tcp_pair().await;
        let (handle, channels) = RelayHandle::channel();
        let task = tokio::spawn(async move { relay.run(relayed, channels).await });

        for _ in 0..2 {
            let (_, command) = sent.recv().await.unwrap();
            assert_eq!(command, Command::establish_connection(connection_id, 4242));
        }
        handle.cancel();
        task.await.unwrap();
    }
}
