//! Decodes commands from a socket, buffering partial frames across chunk boundaries.

use super::socket_data::SocketData;
use drill_core::{decode_command, ByteList, Command, DrillError, DrillResult};
use futures_util::stream::{self, Stream};
use tokio::io::AsyncRead;

pub struct CommandReader {
    buffer: ByteList,
    data: SocketData,
}

impl CommandReader {
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self {
            buffer: ByteList::new(),
            data: SocketData::new(reader),
        }
    }

    /// Read the next command.
    ///
    /// Fails with [`DrillError::Closed`] once the socket is closed with no complete frame left,
    /// and with [`DrillError::InvalidCommand`] on a corrupt stream, which cannot be resynchronized.
    /// Cancel-safe: buffered bytes are kept if the future is dropped.
    pub async fn read_command(&mut self) -> DrillResult<Command> {
        loop {
            match decode_command(self.buffer.as_slice()) {
                Ok((command, size)) => {
                    self.buffer.shift(size);
                    return Ok(command);
                }
                Err(e) if e.is_incomplete() => {}
                Err(e) => return Err(e),
            }

            match self.data.next().await {
                Some(chunk) => self.buffer.push(&chunk),
                None => return Err(DrillError::Closed),
            }
        }
    }

    /// Stream of commands. Ends after yielding the first error.
    pub fn commands(&mut self) -> impl Stream<Item = DrillResult<Command>> + '_ {
        stream::unfold(Some(self), |reader| async move {
            let reader = reader?;
            let result = reader.read_command().await;
            let next = if result.is_ok() { Some(reader) } else { None };
            Some((result, next))
        })
    }

    /// Bytes buffered but not yet decoded.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drill_core::encode_command;
    use futures_util::StreamExt;
    use tokio::io::AsyncWriteExt;
    use uuid::Uuid;

    #[tokio::test]
    async fn reassembles_frames_split_across_chunks() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = CommandReader::new(server);

        let id = Uuid::new_v4();
        let first = Command::send_data(id, vec![0xab; 300]);
        let second = Command::close_connection(id, 9000);
        let mut bytes = encode_command(&first);
        bytes.extend(encode_command(&second));

        let writer = tokio::spawn(async move {
            for piece in bytes.chunks(7) {
                client.write_all(piece).await.unwrap();
                client.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        assert_eq!(reader.read_command().await.unwrap(), first);
        assert_eq!(reader.read_command().await.unwrap(), second);
        assert_eq!(reader.pending(), 0);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn several_frames_in_one_chunk() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = CommandReader::new(server);

        let mut bytes = Vec::new();
        for port in 1..=3u16 {
            bytes.extend(encode_command(&Command::allocate_port(port)));
        }
        client.write_all(&bytes).await.unwrap();

        for port in 1..=3u16 {
            assert_eq!(
                reader.read_command().await.unwrap(),
                Command::allocate_port(port)
            );
        }
    }

    #[tokio::test]
    async fn closed_socket_fails() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = CommandReader::new(server);

        let frame = encode_command(&Command::allocate_port(80));
        client.write_all(&frame[..5]).await.unwrap();
        drop(client);

        assert!(matches!(reader.read_command().await, Err(DrillError::Closed)));
        assert_eq!(reader.pending(), 5);
    }

    #[tokio::test]
    async fn corrupt_stream_fails() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = CommandReader::new(server);

        client.write_all(&[0xee, 0, 0, 0, 0, 0, 0, 0]).await.unwrap();
        assert!(matches!(
            reader.read_command().await,
            Err(DrillError::InvalidCommand(_))
        ));
    }

    #[tokio::test]
    async fn command_stream_ends_after_error() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = CommandReader::new(server);

        client
            .write_all(&encode_command(&Command::allocate_port(1)))
            .await
            .unwrap();
        client
            .write_all(&encode_command(&Command::allocate_port(2)))
            .await
            .unwrap();
        drop(client);

        let results: Vec<_> = reader.commands().collect().await;
        assert_eq!(results.len(), 3);
        assert_eq!(*results[0].as_ref().unwrap(), Command::allocate_port(1));
        assert_eq!(*results[1].as_ref().unwrap(), Command::allocate_port(2));
        assert!(matches!(results[2], Err(DrillError::Closed)));
    }
}
