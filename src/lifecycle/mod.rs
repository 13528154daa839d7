//! Key lifecycle: server-side key generation, escrow and recovery
//!
//! Private keys generated here never leave the process in clear. They are
//! wrapped under the Session's KEK before being handed to the caller or the
//! DRM, and recovered keys come back wrapped under the current Session's KEK.

pub mod keygen;
pub mod mock;
pub mod orchestrator;

use std::fmt;

use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::channel::Algorithm;
use crate::keys::{WrappedBlob, KCV_LEN, NONCE_LEN};
use crate::types::{RaError, Result};

pub use keygen::{GeneratedKeyPair, KeyPairGenerator, SoftwareKeyGenerator};
pub use mock::MockKeyGenerator;
pub use orchestrator::KeyLifecycleOrchestrator;

/// RSA modulus sizes accepted for server-side generation
pub const RSA_KEY_SIZES: [u32; 4] = [1024, 2048, 3072, 4096];

/// Size reported for P-256 keys
pub const EC_P256_KEY_SIZE: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyType {
    #[serde(rename = "RSA")]
    Rsa,
    #[serde(rename = "EC")]
    Ec,
}

impl KeyType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rsa => "RSA",
            Self::Ec => "EC",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RSA" => Some(Self::Rsa),
            "EC" => Some(Self::Ec),
            _ => None,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated key generation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeySpec {
    pub key_type: KeyType,
    pub key_size: u32,
}

impl KeySpec {
    /// RSA of `key_size` bits, or P-256 when `is_ecc` (size must be 256).
    pub fn new(key_size: u32, is_ecc: bool) -> Result<Self> {
        if is_ecc {
            if key_size != EC_P256_KEY_SIZE {
                return Err(RaError::KeyGenFailure(format!(
                    "Unsupported EC key size {} (only {} is supported)",
                    key_size, EC_P256_KEY_SIZE
                )));
            }
            return Ok(Self {
                key_type: KeyType::Ec,
                key_size,
            });
        }
        if !RSA_KEY_SIZES.contains(&key_size) {
            return Err(RaError::KeyGenFailure(format!(
                "Unsupported RSA key size {} (expected one of {:?})",
                key_size, RSA_KEY_SIZES
            )));
        }
        Ok(Self {
            key_type: KeyType::Rsa,
            key_size,
        })
    }

    /// Spec for a token algorithm. DSA and binary-field curves are not
    /// generated server-side.
    pub fn for_algorithm(algorithm: Algorithm, key_size: u32) -> Result<Self> {
        match algorithm {
            Algorithm::Rsa | Algorithm::RsaCrt => Self::new(key_size, false),
            Algorithm::EcFp => Self::new(key_size, true),
            Algorithm::Dsa | Algorithm::EcF2m => Err(RaError::KeyGenFailure(format!(
                "Server-side generation not available for {}",
                algorithm
            ))),
        }
    }

    pub fn is_ecc(&self) -> bool {
        self.key_type == KeyType::Ec
    }
}

fn as_hex<S: Serializer, T: AsRef<[u8]>>(value: &T, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode_upper(value))
}

/// Where an archived key was escrowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveReceipt {
    pub key_id: Option<String>,
    /// DRM endpoint that accepted the key
    pub endpoint: String,
    pub failovers: usize,
}

/// Result of server-side generation or recovery.
///
/// The private key is only ever present wrapped under the owning Session's
/// KEK. The engine hands this off and keeps no copy.
#[derive(Debug, Clone, Serialize)]
pub struct KeyMaterial {
    /// Session whose KEK wraps `wrapped_private_key`
    pub session_id: Uuid,
    pub spec: Option<KeySpec>,
    /// Base64 SubjectPublicKeyInfo DER
    pub public_key: String,
    #[serde(serialize_with = "as_hex")]
    pub wrapped_private_key: Vec<u8>,
    #[serde(serialize_with = "as_hex")]
    pub iv_param: [u8; NONCE_LEN],
    /// KCV of the wrapping KEK
    #[serde(serialize_with = "as_hex")]
    pub key_check_value: [u8; KCV_LEN],
    pub archive: Option<ArchiveReceipt>,
}

impl KeyMaterial {
    /// The wrapped private key as an unwrappable blob
    pub fn wrapped_blob(&self) -> WrappedBlob {
        WrappedBlob {
            iv: self.iv_param,
            ciphertext: self.wrapped_private_key.clone(),
        }
    }
}

/// Certificate whose escrowed key is to be recovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateRecord {
    /// Base64 certificate as held by the token management system
    pub certificate: String,
    /// Base64 SubjectPublicKeyInfo of the certified key
    pub public_key: String,
}

impl CertificateRecord {
    pub fn new(certificate: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            certificate: certificate.into(),
            public_key: public_key.into(),
        }
    }
}
