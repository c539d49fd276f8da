//! Command envelope framing.
//!
//! Wire format: `[1-byte type][3 reserved zero bytes][4-byte LE body length][body]`
//!
//! [`decode_command`] distinguishes a frame that needs more bytes ([`DrillError::Incomplete`])
//! from one that can never decode ([`DrillError::InvalidCommand`]).

use crate::binary::{BinaryReader, BinaryWriter};
use crate::error::{DrillError, DrillResult};
use crate::messages::{Command, CommandType};

/// Bytes before the body: type, reserved, length.
pub const HEADER_SIZE: usize = 1 + RESERVED_SIZE + 4;

const RESERVED_SIZE: usize = 3;

/// Largest accepted body (1 MiB). Relay chunks are far smaller.
pub const MAX_BODY_SIZE: usize = 1_048_576;

/// Encode a command into a complete frame.
pub fn encode_command(command: &Command) -> Vec<u8> {
    let body = command.encode_body();

    let mut writer = BinaryWriter::new();
    writer.write_u8(command.command_type().as_u8());
    writer.write_blank(RESERVED_SIZE);
    writer.write_block(&body);
    writer.to_bytes()
}

/// Decode the first frame in `buffer`.
///
/// Returns the command and the number of bytes it occupied.
pub fn decode_command(buffer: &[u8]) -> DrillResult<(Command, usize)> {
    let mut reader = BinaryReader::new(buffer);

    let tag = reader.read_u8().map_err(|_| DrillError::Incomplete)?;
    let command_type = CommandType::from_u8(tag)
        .ok_or_else(|| DrillError::InvalidCommand(format!("unknown command type 0x{tag:02x}")))?;

    reader
        .skip(RESERVED_SIZE)
        .map_err(|_| DrillError::Incomplete)?;
    let body_len = reader.read_u32().map_err(|_| DrillError::Incomplete)? as usize;
    if body_len > MAX_BODY_SIZE {
        return Err(DrillError::InvalidCommand(format!(
            "{command_type:?} body too large: {body_len} bytes (max {MAX_BODY_SIZE})"
        )));
    }

    let body = reader.read(body_len).map_err(|_| DrillError::Incomplete)?;
    let command = Command::decode_body(command_type, body)?;
    Ok((command, reader.position()))
}
