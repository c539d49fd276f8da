//! Command types exchanged between drill nodes.
//!
//! Every command is framed by [`crate::codec`]; this module only defines the variants and their
//! body layouts. All integers are little-endian, UUIDs travel as 16 raw bytes.
//!
//! | Command               | Body                                         |
//! |-----------------------|----------------------------------------------|
//! | `Auth`                | `[u64 timestamp][32-byte sha256]`            |
//! | `Hello`               | `[16-byte node id]`                          |
//! | `AllocatePort`        | `[u16 port]`                                 |
//! | `EstablishConnection` | `[16-byte connection id][u16 port]`          |
//! | `CloseConnection`     | `[16-byte connection id][u16 port]`          |
//! | `SendData`            | `[16-byte connection id][u32 len][data]`     |

use crate::auth::AuthCommand;
use crate::binary::{BinaryReader, BinaryWriter};
use crate::error::{DrillError, DrillResult};
use uuid::Uuid;

/// Wire tag of each command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandType {
    Auth = 0x00,
    Hello = 0x01,
    AllocatePort = 0x10,
    EstablishConnection = 0x11,
    SendData = 0x12,
    CloseConnection = 0x13,
}

impl CommandType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Auth),
            0x01 => Some(Self::Hello),
            0x10 => Some(Self::AllocatePort),
            0x11 => Some(Self::EstablishConnection),
            0x12 => Some(Self::SendData),
            0x13 => Some(Self::CloseConnection),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A decoded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Auth(AuthCommand),
    Hello { node_id: Uuid },
    AllocatePort { port: u16 },
    EstablishConnection { connection_id: Uuid, port: u16 },
    CloseConnection { connection_id: Uuid, port: u16 },
    SendData { connection_id: Uuid, data: Vec<u8> },
}

impl Command {
    pub fn hello(node_id: Uuid) -> Self {
        Self::Hello { node_id }
    }

    pub fn allocate_port(port: u16) -> Self {
        Self::AllocatePort { port }
    }

    pub fn establish_connection(connection_id: Uuid, port: u16) -> Self {
        Self::EstablishConnection {
            connection_id,
            port,
        }
    }

    pub fn close_connection(connection_id: Uuid, port: u16) -> Self {
        Self::CloseConnection {
            connection_id,
            port,
        }
    }

    pub fn send_data(connection_id: Uuid, data: Vec<u8>) -> Self {
        Self::SendData {
            connection_id,
            data,
        }
    }

    pub fn command_type(&self) -> CommandType {
        match self {
            Self::Auth(_) => CommandType::Auth,
            Self::Hello { .. } => CommandType::Hello,
            Self::AllocatePort { .. } => CommandType::AllocatePort,
            Self::EstablishConnection { .. } => CommandType::EstablishConnection,
            Self::CloseConnection { .. } => CommandType::CloseConnection,
            Self::SendData { .. } => CommandType::SendData,
        }
    }

    /// Connection id carried by connection-scoped commands.
    pub fn connection_id(&self) -> Option<Uuid> {
        match self {
            Self::EstablishConnection { connection_id, .. }
            | Self::CloseConnection { connection_id, .. }
            | Self::SendData { connection_id, .. } => Some(*connection_id),
            _ => None,
        }
    }

    /// Encode the variant-specific body (without envelope).
    pub fn encode_body(&self) -> Vec<u8> {
        let mut writer = BinaryWriter::new();
        match self {
            Self::Auth(auth) => writer.write(&auth.signature),
            Self::Hello { node_id } => writer.write_uuid(node_id),
            Self::AllocatePort { port } => writer.write_u16(*port),
            Self::EstablishConnection {
                connection_id,
                port,
            }
            | Self::CloseConnection {
                connection_id,
                port,
            } => {
                writer.write_uuid(connection_id);
                writer.write_u16(*port);
            }
            Self::SendData {
                connection_id,
                data,
            } => {
                writer.write_uuid(connection_id);
                writer.write_block(data);
            }
        }
        writer.to_bytes()
    }

    /// Decode a complete body of the given type.
    ///
    /// The body has already been cut to its declared length, so any shortfall or trailing
    /// garbage is a malformed command, never an incomplete one.
    pub fn decode_body(command_type: CommandType, body: &[u8]) -> DrillResult<Self> {
        let mut reader = BinaryReader::new(body);
        let command = Self::read_body(command_type, &mut reader).map_err(|e| match e {
            DrillError::OutOfBounds => {
                DrillError::InvalidCommand(format!("truncated {command_type:?} body"))
            }
            other => other,
        })?;

        if reader.remaining() != 0 {
            return Err(DrillError::InvalidCommand(format!(
                "{} trailing bytes in {command_type:?} body",
                reader.remaining()
            )));
        }
        Ok(command)
    }

    fn read_body(command_type: CommandType, reader: &mut BinaryReader<'_>) -> DrillResult<Self> {
        Ok(match command_type {
            // Raw signature; its length is checked during validation.
            CommandType::Auth => Self::Auth(AuthCommand {
                signature: reader.read(reader.remaining())?.to_vec(),
            }),
            CommandType::Hello => Self::Hello {
                node_id: reader.read_uuid()?,
            },
            CommandType::AllocatePort => Self::AllocatePort {
                port: reader.read_u16()?,
            },
            CommandType::EstablishConnection => Self::EstablishConnection {
                connection_id: reader.read_uuid()?,
                port: reader.read_u16()?,
            },
            CommandType::CloseConnection => Self::CloseConnection {
                connection_id: reader.read_uuid()?,
                port: reader.read_u16()?,
            },
            CommandType::SendData => Self::SendData {
                connection_id: reader.read_uuid()?,
                data: reader.read_block()?.to_vec(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_type_tags() {
        for ty in [
            CommandType::Auth,
            CommandType::Hello,
            CommandType::AllocatePort,
            CommandType::EstablishConnection,
            CommandType::SendData,
            CommandType::CloseConnection,
        ] {
            assert_eq!(CommandType::from_u8(ty.as_u8()), Some(ty));
        }
        assert_eq!(CommandType::from_u8(0x02), None);
        assert_eq!(CommandType::from_u8(0xff), None);
    }

    #[test]
    fn body_sizes() {
        let id = Uuid::new_v4();
        assert_eq!(Command::hello(id).encode_body().len(), 16);
        assert_eq!(Command::allocate_port(45000).encode_body(), 45000u16.to_le_bytes());
        assert_eq!(Command::establish_connection(id, 80).encode_body().len(), 18);
        assert_eq!(Command::close_connection(id, 80).encode_body().len(), 18);
        assert_eq!(Command::send_data(id, vec![7; 10]).encode_body().len(), 16 + 4 + 10);
    }

    #[test]
    fn send_data_layout() {
        let id = Uuid::new_v4();
        let body = Command::send_data(id, b"abc".to_vec()).encode_body();
        assert_eq!(&body[..16], id.as_bytes());
        assert_eq!(&body[16..20], &3u32.to_le_bytes());
        assert_eq!(&body[20..], b"abc");
    }

    #[test]
    fn truncated_body_is_invalid() {
        let body = Command::hello(Uuid::new_v4()).encode_body();
        let err = Command::decode_body(CommandType::Hello, &body[..10]).unwrap_err();
        assert!(matches!(err, DrillError::InvalidCommand(_)));
    }

    #[test]
    fn trailing_bytes_are_invalid() {
        let mut body = Command::allocate_port(22).encode_body();
        body.push(0);
        let err = Command::decode_body(CommandType::AllocatePort, &body).unwrap_err();
        assert!(matches!(err, DrillError::InvalidCommand(_)));
    }

    #[test]
    fn auth_body_is_kept_raw_at_any_length() {
        for body in [&[][..], &[1u8, 2, 3][..], &[7u8; 40][..]] {
            let command = Command::decode_body(CommandType::Auth, body).unwrap();
            assert_eq!(
                command,
                Command::Auth(AuthCommand {
                    signature: body.to_vec()
                })
            );
        }
    }

    #[test]
    fn connection_id_accessor() {
        let id = Uuid::new_v4();
        assert_eq!(Command::send_data(id, vec![]).connection_id(), Some(id));
        assert_eq!(Command::allocate_port(1).connection_id(), None);
    }
}
