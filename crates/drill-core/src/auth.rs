//! Password-based `Auth` signatures.
//!
//! Format: `[8-byte LE timestamp millis][32-byte SHA-256(timestamp decimal || password)]`
//!
//! A signature is accepted for five minutes on either side of the validator's clock.

use crate::binary::{BinaryReader, BinaryWriter};
use crate::error::AuthError;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;

/// Maximum clock distance between signer and validator.
pub const AUTH_LIFETIME_MS: u64 = 5 * 60 * 1000;

const TIMESTAMP_LENGTH: usize = 8;
const HASH_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = TIMESTAMP_LENGTH + HASH_LENGTH;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCommand {
    pub signature: Vec<u8>,
}

impl AuthCommand {
    /// Sign the current time with `password`.
    pub fn create(password: &str) -> Self {
        Self::create_at(password, now_millis())
    }

    /// Sign an explicit timestamp.
    pub fn create_at(password: &str, timestamp_ms: u64) -> Self {
        let mut writer = BinaryWriter::new();
        writer.write_u64(timestamp_ms);
        writer.write(&signature_hash(timestamp_ms, password));
        Self {
            signature: writer.to_bytes(),
        }
    }

    /// Validate against `password` and the current time.
    pub fn validate(&self, password: &str) -> Result<(), AuthError> {
        self.validate_at(password, now_millis())
    }

    /// Validate against `password` as if the current time were `now_ms`.
    pub fn validate_at(&self, password: &str, now_ms: u64) -> Result<(), AuthError> {
        if self.signature.len() != SIGNATURE_LENGTH {
            return Err(AuthError::InvalidData);
        }

        let mut reader = BinaryReader::new(&self.signature);
        let timestamp = reader.read_u64().map_err(|_| AuthError::InvalidData)?;
        let hash = reader
            .read(HASH_LENGTH)
            .map_err(|_| AuthError::InvalidData)?;

        if timestamp.abs_diff(now_ms) > AUTH_LIFETIME_MS {
            return Err(AuthError::Expired);
        }

        let expected = signature_hash(timestamp, password);
        if !bool::from(hash.ct_eq(&expected[..])) {
            return Err(AuthError::PasswordMismatch);
        }
        Ok(())
    }

    /// Timestamp embedded in the signature, if well-formed.
    pub fn timestamp(&self) -> Option<u64> {
        BinaryReader::new(&self.signature).read_u64().ok()
    }
}

fn signature_hash(timestamp_ms: u64, password: &str) -> [u8; HASH_LENGTH] {
    let mut hasher = Sha256::new();
    hasher.update(timestamp_ms.to_string().as_bytes());
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Milliseconds since the unix epoch. A clock before 1970 reads as zero.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_717_000_000_000;

    #[test]
    fn create_and_validate() {
        let auth = AuthCommand::create("secret");
        assert_eq!(auth.signature.len(), SIGNATURE_LENGTH);
        assert!(auth.validate("secret").is_ok());
    }

    #[test]
    fn digest_covers_decimal_timestamp_and_password() {
        let auth = AuthCommand::create_at("pw", 1234);
        let expected: [u8; 32] = Sha256::digest(b"1234pw").into();
        assert_eq!(&auth.signature[..8], &1234u64.to_le_bytes());
        assert_eq!(&auth.signature[8..], &expected);
        assert_eq!(auth.timestamp(), Some(1234));
    }

    #[test]
    fn accepts_within_window() {
        let auth = AuthCommand::create_at("secret", NOW - 299_000);
        assert_eq!(auth.validate_at("secret", NOW), Ok(()));

        let future = AuthCommand::create_at("secret", NOW + 299_000);
        assert_eq!(future.validate_at("secret", NOW), Ok(()));
    }

    #[test]
    fn rejects_expired() {
        let auth = AuthCommand::create_at("secret", NOW - 301_000);
        assert_eq!(auth.validate_at("secret", NOW), Err(AuthError::Expired));

        let future = AuthCommand::create_at("secret", NOW + 301_000);
        assert_eq!(future.validate_at("secret", NOW), Err(AuthError::Expired));
    }

    #[test]
    fn rejects_wrong_password() {
        let auth = AuthCommand::create_at("secret", NOW);
        assert_eq!(
            auth.validate_at("other", NOW),
            Err(AuthError::PasswordMismatch)
        );
    }

    #[test]
    fn rejects_bad_length() {
        let auth = AuthCommand {
            signature: vec![0u8; 12],
        };
        assert_eq!(auth.validate_at("secret", NOW), Err(AuthError::InvalidData));
        assert_eq!(
            AuthCommand { signature: vec![] }.validate_at("", NOW),
            Err(AuthError::InvalidData)
        );
    }

    #[test]
    fn empty_password_round_trip() {
        let auth = AuthCommand::create_at("", NOW);
        assert!(auth.validate_at("", NOW).is_ok());
        assert!(auth.validate_at("x", NOW).is_err());
    }
}
