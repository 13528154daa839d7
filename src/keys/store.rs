//! Named symmetric key store.
//!
//! Holds the long-lived keys the engine is provisioned with, looked up by
//! name the way a token slot is searched for a key nickname.

use std::collections::HashMap;

use super::symkey::SymKey;
use crate::types::{RaError, Result};

/// Key shared with the TKS for unwrapping session keys
pub const TRANSPORT_KEY_NAME: &str = "sharedSecret";

/// Key shared with the DRM for wrapping the session KEK
pub const DRM_TRANSPORT_KEY_NAME: &str = "drmTransport";

/// Locally held master key; its presence enables local diversification
pub const MASTER_KEY_NAME: &str = "masterKey";

#[derive(Debug, Default, Clone)]
pub struct KeyStore {
    keys: HashMap<String, SymKey>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, key: SymKey) {
        self.keys.insert(name.into(), key);
    }

    pub fn with_key(mut self, name: impl Into<String>, key: SymKey) -> Self {
        self.insert(name, key);
        self
    }

    /// Find a key by name.
    pub fn find(&self, name: &str) -> Option<&SymKey> {
        self.keys.get(name)
    }

    /// Find a key by name, failing with a configuration error when absent.
    pub fn require(&self, name: &str) -> Result<&SymKey> {
        self.find(name)
            .ok_or_else(|| RaError::Configuration(format!("Key '{}' is not provisioned", name)))
    }

    pub fn transport_key(&self) -> Result<&SymKey> {
        self.require(TRANSPORT_KEY_NAME)
    }

    pub fn drm_transport_key(&self) -> Result<&SymKey> {
        self.require(DRM_TRANSPORT_KEY_NAME)
    }

    pub fn master_key(&self) -> Option<&SymKey> {
        self.find(MASTER_KEY_NAME)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }
}
