//! Engine context
//!
//! `RaContext` owns everything the engine shares between sessions: the
//! configuration snapshot, the backend pools, the named keys, the
//! card-cryptogram verification lock and the diagnostics front end. Components
//! are handed out already wired to it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::http::HttpTransport;
use crate::backend::{BackendKind, BackendTransport};
use crate::channel::crypto::{
    compute_card_cryptogram, compute_host_cryptogram, derive_local_session_keys,
};
use crate::channel::{ChannelParams, SecureChannelCrypto};
use crate::config::ConfigSnapshot;
use crate::diagnostics::{Diagnostics, LogLevel};
use crate::keys::{key_check_value, unwrap, wrap, KeyStore, SymKey};
use crate::lifecycle::{KeyLifecycleOrchestrator, KeyPairGenerator, SoftwareKeyGenerator};
use crate::pool::{BackendPools, ConnectionPool};
use crate::session::SessionKeyDeriver;
use crate::types::{RaError, Result};

/// Shared state of one RA engine instance.
#[derive(Clone)]
pub struct RaContext {
    config: Arc<ConfigSnapshot>,
    pools: BackendPools,
    keys: Arc<KeyStore>,
    verify_lock: Arc<Mutex<()>>,
    diagnostics: Diagnostics,
    generator: Arc<dyn KeyPairGenerator>,
}

impl RaContext {
    pub fn new(
        config: ConfigSnapshot,
        pools: BackendPools,
        keys: KeyStore,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            config: Arc::new(config),
            pools,
            keys: Arc::new(keys),
            verify_lock: Arc::new(Mutex::new(())),
            diagnostics,
            generator: Arc::new(SoftwareKeyGenerator),
        }
    }

    /// Build HTTP-backed pools from the snapshot's endpoint lists.
    pub fn connect(config: ConfigSnapshot, keys: KeyStore, diagnostics: Diagnostics) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| RaError::Configuration(format!("HTTP client: {}", e)))?;

        let pool = |kind: BackendKind, urls: &[String]| {
            let slots = urls
                .iter()
                .map(|url| {
                    Arc::new(HttpTransport::with_client(kind, url.as_str(), client.clone()))
                        as Arc<dyn BackendTransport>
                })
                .collect();
            ConnectionPool::with_diagnostics(kind, slots, diagnostics.clone())
        };
        let pools = BackendPools::new(
            pool(BackendKind::Tks, &config.tks_urls),
            pool(BackendKind::Ca, &config.ca_urls),
            pool(BackendKind::Drm, &config.drm_urls),
        )?;

        for kind in BackendKind::ALL {
            let p = pools.pool(kind);
            diagnostics.debug(
                LogLevel::PerServer,
                "RaContext::connect",
                "Backend pool ready",
                &[("kind", &kind), ("connections", &p.len())],
            );
        }

        Ok(Self::new(config, pools, keys, diagnostics))
    }

    /// Replace the key pair generator (hardware token, test double).
    pub fn with_generator(mut self, generator: Arc<dyn KeyPairGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn config(&self) -> &ConfigSnapshot {
        &self.config
    }

    pub fn pools(&self) -> &BackendPools {
        &self.pools
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.keys
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Lock serializing card-cryptogram verification across sessions
    pub fn verify_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.verify_lock)
    }

    pub fn crypto(&self) -> SecureChannelCrypto {
        SecureChannelCrypto::new(Arc::clone(&self.keys), self.verify_lock())
    }

    pub fn deriver(&self) -> SessionKeyDeriver {
        SessionKeyDeriver::new(self.crypto(), self.pools.clone(), self.diagnostics.clone())
    }

    pub fn orchestrator(&self) -> KeyLifecycleOrchestrator {
        KeyLifecycleOrchestrator::new(
            self.pools.clone(),
            Arc::clone(&self.generator),
            self.diagnostics.clone(),
        )
    }
}

/// Known-answer check of the local crypto profile, run once at startup.
///
/// Derives one fixed session twice and checks that the results agree, that
/// both cryptograms are distinct, and that a wrapped key round-trips.
pub fn crypto_self_test() -> Result<()> {
    let master = SymKey::from_bytes([0x5A; 32]);
    let card_challenge = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF];
    let host_challenge = [0xFE, 0xDC, 0xBA, 0x98, 0x76, 0x54, 0x32, 0x10];
    let params = ChannelParams {
        cuid: &[0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0, 0x11, 0x22],
        key_info: &[0x01, 0x01],
        card_challenge: &card_challenge,
        host_challenge: &host_challenge,
        card_cryptogram: &[0; 8],
        key_set: "selfTest",
    };

    let (_, enc_a, kek_a) = derive_local_session_keys(&master, &params)?;
    let (_, enc_b, kek_b) = derive_local_session_keys(&master, &params)?;
    if enc_a != enc_b || kek_a != kek_b {
        return Err(RaError::CryptoFailure("Self-test: derivation is not deterministic".into()));
    }

    let host = compute_host_cryptogram(&enc_a, &card_challenge, &host_challenge)?;
    if host != compute_host_cryptogram(&enc_b, &card_challenge, &host_challenge)? {
        return Err(RaError::CryptoFailure("Self-test: host cryptogram is not deterministic".into()));
    }
    if host == compute_card_cryptogram(&enc_a, &card_challenge, &host_challenge)? {
        return Err(RaError::CryptoFailure("Self-test: host and card cryptograms collide".into()));
    }

    let blob = wrap(&kek_a, enc_a.as_bytes())?;
    if unwrap(&kek_b, &blob)?.as_slice() != enc_a.as_bytes() {
        return Err(RaError::CryptoFailure("Self-test: key wrap round trip failed".into()));
    }
    key_check_value(&kek_a)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_self_test_passes() {
        crypto_self_test().unwrap();
    }

    #[tokio::test]
    async fn test_connect_builds_pools_from_snapshot() {
        let mut config = ConfigSnapshot::empty();
        config.tks_urls = vec!["http://tks-0:8080".into(), "http://tks-1:8080".into()];
        config.drm_urls = vec!["http://drm-0:8080".into()];

        let ctx = RaContext::connect(config, KeyStore::new(), Diagnostics::default()).unwrap();
        assert_eq!(ctx.pools().pool(BackendKind::Tks).len(), 2);
        assert_eq!(ctx.pools().pool(BackendKind::Ca).len(), 0);
        assert_eq!(ctx.pools().pool(BackendKind::Drm).endpoints(), vec!["http://drm-0:8080"]);
    }

    #[test]
    fn test_verify_lock_is_shared() {
        let ctx = RaContext::new(
            ConfigSnapshot::empty(),
            BackendPools::new(
                ConnectionPool::new(BackendKind::Tks, Vec::new()),
                ConnectionPool::new(BackendKind::Ca, Vec::new()),
                ConnectionPool::new(BackendKind::Drm, Vec::new()),
            )
            .unwrap(),
            KeyStore::new(),
            Diagnostics::default(),
        );
        assert!(Arc::ptr_eq(&ctx.verify_lock(), &ctx.verify_lock()));
    }
}
