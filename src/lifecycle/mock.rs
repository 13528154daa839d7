//! Mock key pair generator for testing.
//!
//! Produces deterministic, structurally opaque key blobs instantly, so
//! workflow tests can ask for RSA-4096 without paying for prime search.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::keygen::{GeneratedKeyPair, KeyPairGenerator};
use super::KeySpec;
use crate::types::{RaError, Result};

/// Mock generator for testing
pub struct MockKeyGenerator {
    fail: AtomicBool,
    call_count: AtomicU32,
}

impl Default for MockKeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockKeyGenerator {
    pub fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            call_count: AtomicU32::new(0),
        }
    }

    /// Make every generate call fail with `KeyGenFailure`.
    pub fn with_failure(self) -> Self {
        self.fail.store(true, Ordering::SeqCst);
        self
    }

    /// Get the number of times generate was called.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Private key bytes the n-th call (1-based) returns for `spec`.
    pub fn private_key_for(spec: &KeySpec, call: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(spec.key_size as usize / 8);
        let mut counter = 0u32;
        while out.len() < spec.key_size as usize / 8 {
            let block = Sha256::new()
                .chain_update(b"mock private ")
                .chain_update(spec.key_type.as_str())
                .chain_update(spec.key_size.to_be_bytes())
                .chain_update(call.to_be_bytes())
                .chain_update(counter.to_be_bytes())
                .finalize();
            out.extend_from_slice(&block);
            counter += 1;
        }
        out.truncate(spec.key_size as usize / 8);
        out
    }
}

impl KeyPairGenerator for MockKeyGenerator {
    fn generate(&self, spec: &KeySpec) -> Result<GeneratedKeyPair> {
        let call = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail.load(Ordering::SeqCst) {
            return Err(RaError::KeyGenFailure("mock generator failure".into()));
        }
        let private = Self::private_key_for(spec, call);
        let public = Sha256::new()
            .chain_update(b"mock public ")
            .chain_update(&private)
            .finalize()
            .to_vec();
        Ok(GeneratedKeyPair {
            public_key_der: public,
            private_key_der: Zeroizing::new(private),
        })
    }
}
