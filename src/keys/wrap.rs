//! Key wrapping primitives.
//!
//! # Algorithms
//!
//! - **Wrapping**: ChaCha20-Poly1305 (authenticated, so unwrapping under the
//!   wrong KEK fails instead of yielding garbage)
//! - **Key check value**: first 3 bytes of a zero block encrypted under the key
//!
//! A wrapped blob on the wire is `nonce || ciphertext || tag`. The nonce is the
//! IV parameter handed to the token alongside the wrapped private key.

use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use super::symkey::{SymKey, SYM_KEY_LEN};
use crate::types::{RaError, Result};

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// Poly1305 authentication tag length (16 bytes)
pub const AUTH_TAG_LEN: usize = 16;

/// Key check value length (3 bytes)
pub const KCV_LEN: usize = 3;

/// Private key material wrapped under a KEK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedBlob {
    pub iv: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl WrappedBlob {
    /// Split a `nonce || ciphertext` wire value.
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NONCE_LEN + AUTH_TAG_LEN {
            return Err(RaError::CryptoFailure(format!(
                "Wrapped blob too short: {} bytes",
                bytes.len()
            )));
        }
        let (iv, ciphertext) = bytes.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(iv);
        Ok(Self {
            iv: nonce,
            ciphertext: ciphertext.to_vec(),
        })
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out
    }
}

/// Generate cryptographically secure random bytes.
pub fn generate_random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Wrap arbitrary key bytes under `kek` with a fresh random nonce.
pub fn wrap(kek: &SymKey, plaintext: &[u8]) -> Result<WrappedBlob> {
    wrap_with_iv(kek, plaintext, generate_random_bytes())
}

/// Wrap with a caller-chosen nonce. The nonce must never repeat for one KEK.
pub fn wrap_with_iv(kek: &SymKey, plaintext: &[u8], iv: [u8; NONCE_LEN]) -> Result<WrappedBlob> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(kek.as_bytes()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| RaError::CryptoFailure(format!("Wrap failed: {e}")))?;
    Ok(WrappedBlob { iv, ciphertext })
}

/// Unwrap a blob. Fails with `CryptoFailure` when the tag doesn't verify,
/// which is what a KEK/session mismatch looks like.
pub fn unwrap(kek: &SymKey, blob: &WrappedBlob) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(kek.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(&blob.iv), blob.ciphertext.as_slice())
        .map(Zeroizing::new)
        .map_err(|_| RaError::CryptoFailure("Unwrap failed (wrong KEK?)".into()))
}

/// Wrap a symmetric key for transport (TKS session keys, DRM transport KEK).
pub fn wrap_sym_key(wrapping_key: &SymKey, key: &SymKey) -> Result<Vec<u8>> {
    Ok(wrap(wrapping_key, key.as_bytes())?.to_wire())
}

/// Reverse of [`wrap_sym_key`].
pub fn unwrap_sym_key(wrapping_key: &SymKey, wire: &[u8]) -> Result<SymKey> {
    let blob = WrappedBlob::from_wire(wire)?;
    let plain = unwrap(wrapping_key, &blob)?;
    if plain.len() != SYM_KEY_LEN {
        return Err(RaError::CryptoFailure(format!(
            "Unwrapped key has length {}, expected {}",
            plain.len(),
            SYM_KEY_LEN
        )));
    }
    SymKey::from_slice(&plain)
}

/// Key check value: identifies a key without revealing it.
pub fn key_check_value(key: &SymKey) -> Result<[u8; KCV_LEN]> {
    let block = wrap_with_iv(key, &[0u8; 16], [0u8; NONCE_LEN])?;
    let mut kcv = [0u8; KCV_LEN];
    kcv.copy_from_slice(&block.ciphertext[..KCV_LEN]);
    Ok(kcv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> SymKey {
        SymKey::from_bytes([b; SYM_KEY_LEN])
    }

    #[test]
    fn test_wrap_unwrap() {
        let blob = wrap(&key(1), b"private key bytes").unwrap();
        assert_eq!(blob.ciphertext.len(), 17 + AUTH_TAG_LEN);
        let plain = unwrap(&key(1), &blob).unwrap();
        assert_eq!(plain.as_slice(), b"private key bytes");
    }

    #[test]
    fn test_unwrap_wrong_kek_fails() {
        let blob = wrap(&key(1), b"secret").unwrap();
        let err = unwrap(&key(2), &blob).unwrap_err();
        assert!(matches!(err, RaError::CryptoFailure(_)));
    }

    #[test]
    fn test_wire_format_splits_nonce() {
        let blob = wrap(&key(3), b"abc").unwrap();
        let wire = blob.to_wire();
        assert_eq!(&wire[..NONCE_LEN], &blob.iv);
        assert_eq!(WrappedBlob::from_wire(&wire).unwrap(), blob);
        assert!(WrappedBlob::from_wire(&wire[..10]).is_err());
    }

    #[test]
    fn test_sym_key_transport() {
        let wire = wrap_sym_key(&key(4), &key(9)).unwrap();
        assert_eq!(unwrap_sym_key(&key(4), &wire).unwrap(), key(9));
    }

    #[test]
    fn test_kcv_is_stable_and_key_specific() {
        assert_eq!(key_check_value(&key(5)).unwrap(), key_check_value(&key(5)).unwrap());
        assert_ne!(key_check_value(&key(5)).unwrap(), key_check_value(&key(6)).unwrap());
    }
}
