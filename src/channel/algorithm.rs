//! Token key algorithms.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{RaError, Result};

/// Key algorithm negotiated for a token. Discriminants match the applet's
/// algorithm bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Algorithm {
    Rsa = 1,
    RsaCrt = 2,
    Dsa = 3,
    EcF2m = 4,
    EcFp = 5,
}

impl Algorithm {
    pub fn from_byte(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Rsa),
            2 => Ok(Self::RsaCrt),
            3 => Ok(Self::Dsa),
            4 => Ok(Self::EcF2m),
            5 => Ok(Self::EcFp),
            other => Err(RaError::KeyGenFailure(format!("Unknown algorithm byte {}", other))),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Elliptic-curve algorithms pick EC key generation and wrap parameters.
    pub fn is_ecc(self) -> bool {
        matches!(self, Self::EcF2m | Self::EcFp)
    }
}

/// Classify a raw algorithm byte; unknown bytes are not ECC.
pub fn is_algorithm_ecc(algorithm: u8) -> bool {
    Algorithm::from_byte(algorithm)
        .map(Algorithm::is_ecc)
        .unwrap_or(false)
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rsa => "RSA",
            Self::RsaCrt => "RSA-CRT",
            Self::Dsa => "DSA",
            Self::EcF2m => "EC-F2M",
            Self::EcFp => "EC-FP",
        })
    }
}
