//! Symmetric key handle.
//!
//! Key bytes are zeroized on drop and never appear in `Debug` output.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::{RaError, Result};

/// Length of every symmetric key in the secure-channel profile (32 bytes)
pub const SYM_KEY_LEN: usize = 32;

/// A 256-bit symmetric key (session key, KEK, transport key or master key).
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymKey([u8; SYM_KEY_LEN]);

impl SymKey {
    pub fn from_bytes(bytes: [u8; SYM_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice, rejecting anything that isn't exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; SYM_KEY_LEN] = bytes.try_into().map_err(|_| {
            RaError::CryptoFailure(format!(
                "Invalid key length: expected {}, got {}",
                SYM_KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Parse a hex-encoded key (configuration and wire format).
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let mut bytes = hex::decode(hex_str.trim())
            .map_err(|e| RaError::CryptoFailure(format!("Invalid key encoding: {e}")))?;
        let key = Self::from_slice(&bytes);
        bytes.zeroize();
        key
    }

    pub fn as_bytes(&self) -> &[u8; SYM_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SymKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymKey(<redacted>)")
    }
}
