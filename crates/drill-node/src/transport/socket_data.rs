//! Pull-based chunk sequence over a socket read half.
//!
//! A pump task reads the socket and pushes every chunk into an unbounded channel; [`SocketData::next`]
//! pulls them in arrival order. Chunks are never merged or split. Once the socket reaches EOF or
//! fails, the chunks already queued are still delivered before `next` returns `None`.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Read buffer size of the pump task.
pub const CHUNK_SIZE: usize = 8192;

pub struct SocketData {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pump: JoinHandle<()>,
}

impl SocketData {
    /// Start pumping `reader`. Must be called inside a tokio runtime.
    pub fn new<R>(mut reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(async move {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        trace!("socket reached EOF");
                        break;
                    }
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "socket read failed");
                        break;
                    }
                }
            }
        });

        Self { rx, pump }
    }

    /// Next chunk, waiting for one if none is queued. `None` once the socket is closed and drained.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

}

impl Drop for SocketData {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn yields_chunks_in_order_then_none() {
        let (client, server) = tokio::io::duplex(64);
        let mut data = SocketData::new(server);
        let mut client = client;

        client.write_all(b"first").await.unwrap();
        assert_eq!(data.next().await.unwrap(), b"first");

        client.write_all(b"second").await.unwrap();
        assert_eq!(data.next().await.unwrap(), b"second");

        drop(client);
        assert_eq!(data.next().await, None);
    }

    #[tokio::test]
    async fn queued_chunks_survive_close() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"tail").await.unwrap();
        drop(client);

        let mut data = SocketData::new(server);
        let mut received = Vec::new();
        while let Some(chunk) = data.next().await {
            received.extend(chunk);
        }
        assert_eq!(received, b"tail");
    }

    #[tokio::test]
    async fn large_writes_arrive_complete() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut data = SocketData::new(server);
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
        });

        let mut received = Vec::new();
        while received.len() < expected.len() {
            let chunk = data.next().await.unwrap();
            assert!(chunk.len() <= CHUNK_SIZE);
            received.extend(chunk);
        }
        writer.await.unwrap();
        assert_eq!(received, expected);
    }
}
