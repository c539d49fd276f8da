//! Encodes commands onto a socket write half.

use drill_core::{encode_command, Command, DrillError, DrillResult};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub struct CommandWriter<W> {
    writer: W,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> CommandWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            closed: false,
        }
    }

    /// Encode and write one command. Completes once the frame is flushed.
    ///
    /// A failed write marks the writer closed; every later write fails with
    /// [`DrillError::Closed`].
    pub async fn write_command(&mut self, command: &Command) -> DrillResult<()> {
        if self.closed {
            return Err(DrillError::Closed);
        }

        let frame = encode_command(command);
        let result = match self.writer.write_all(&frame).await {
            Ok(()) => self.writer.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            debug!(error = %e, command = ?command.command_type(), "command write failed");
            self.closed = true;
            return Err(e.into());
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Shut the write half down. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.writer.shutdown().await;
    }
}
