//! Key pair generation.

use p256::pkcs8::{EncodePrivateKey as _, EncodePublicKey as _};
use rand::rngs::OsRng;
use rsa::{RsaPrivateKey, RsaPublicKey};
use zeroize::Zeroizing;

use super::{KeySpec, KeyType};
use crate::types::{RaError, Result};

/// A freshly generated key pair in DER form.
pub struct GeneratedKeyPair {
    /// SubjectPublicKeyInfo DER
    pub public_key_der: Vec<u8>,
    /// PKCS#8 PrivateKeyInfo DER, zeroized on drop
    pub private_key_der: Zeroizing<Vec<u8>>,
}

/// Source of key pairs. Implementations may block; callers run them off the
/// async executor.
pub trait KeyPairGenerator: Send + Sync {
    fn generate(&self, spec: &KeySpec) -> Result<GeneratedKeyPair>;
}

/// In-process generator backed by the `rsa` and `p256` crates.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareKeyGenerator;

impl SoftwareKeyGenerator {
    fn generate_rsa(bits: usize) -> Result<GeneratedKeyPair> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| RaError::KeyGenFailure(format!("RSA-{} generation failed: {}", bits, e)))?;
        let public = RsaPublicKey::from(&private);

        let private_der = rsa::pkcs8::EncodePrivateKey::to_pkcs8_der(&private)
            .map_err(|e| RaError::KeyGenFailure(format!("PKCS#8 encoding failed: {}", e)))?;
        let public_der = rsa::pkcs8::EncodePublicKey::to_public_key_der(&public)
            .map_err(|e| RaError::KeyGenFailure(format!("SPKI encoding failed: {}", e)))?;

        Ok(GeneratedKeyPair {
            public_key_der: public_der.as_bytes().to_vec(),
            private_key_der: Zeroizing::new(private_der.as_bytes().to_vec()),
        })
    }

    fn generate_p256() -> Result<GeneratedKeyPair> {
        let secret = p256::SecretKey::random(&mut OsRng);
        let private_der = secret
            .to_pkcs8_der()
            .map_err(|e| RaError::KeyGenFailure(format!("PKCS#8 encoding failed: {}", e)))?;
        let public_der = secret
            .public_key()
            .to_public_key_der()
            .map_err(|e| RaError::KeyGenFailure(format!("SPKI encoding failed: {}", e)))?;

        Ok(GeneratedKeyPair {
            public_key_der: public_der.as_bytes().to_vec(),
            private_key_der: Zeroizing::new(private_der.as_bytes().to_vec()),
        })
    }
}

impl KeyPairGenerator for SoftwareKeyGenerator {
    fn generate(&self, spec: &KeySpec) -> Result<GeneratedKeyPair> {
        match spec.key_type {
            KeyType::Rsa => Self::generate_rsa(spec.key_size as usize),
            KeyType::Ec => Self::generate_p256(),
        }
    }
}
