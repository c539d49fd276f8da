//! drill-core: Shared protocol library for drill nodes.
//!
//! Provides the binary writer/reader, the frame reassembly buffer, command types and their
//! envelope codec, password `Auth` signatures, and bounded retry.

pub mod auth;
pub mod binary;
pub mod codec;
pub mod error;
pub mod list;
pub mod messages;
pub mod retry;

// Re-export commonly used items at crate root.
pub use auth::AuthCommand;
pub use codec::{decode_command, encode_command};
pub use error::{AuthError, DrillError, DrillResult};
pub use list::ByteList;
pub use messages::{Command, CommandType};
pub use retry::{with_retry, RetryOptions};
