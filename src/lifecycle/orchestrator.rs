//! Server-side key generation and key recovery workflows.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::{
    ArchiveReceipt, CertificateRecord, GeneratedKeyPair, KeyMaterial, KeyPairGenerator, KeySpec,
    KeyType,
};
use crate::backend::{
    fields, BackendKind, BackendOp, BackendRequest, BackendResponse, BackendTransport,
    STATUS_NO_SUCH_KEY,
};
use crate::diagnostics::{Diagnostics, LogLevel};
use crate::keys::{unwrap, wrap, SymKey, WrappedBlob, NONCE_LEN};
use crate::pool::{BackendPools, Served};
use crate::session::{Session, LOCAL_CONNECTION_ID};
use crate::types::{RaError, Result};

/// Runs key generation and recovery on top of Derived Sessions.
#[derive(Clone)]
pub struct KeyLifecycleOrchestrator {
    pools: BackendPools,
    generator: Arc<dyn KeyPairGenerator>,
    diagnostics: Diagnostics,
}

impl KeyLifecycleOrchestrator {
    pub fn new(
        pools: BackendPools,
        generator: Arc<dyn KeyPairGenerator>,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            pools,
            generator,
            diagnostics,
        }
    }

    /// Generate a key pair for `user_id`, wrap the private key under the
    /// session KEK and, when `archive` is set, escrow it with a DRM.
    ///
    /// No DRM connection is touched unless `archive` is set.
    pub async fn server_side_key_gen(
        &self,
        session: &Session,
        user_id: &str,
        key_size: u32,
        is_ecc: bool,
        archive: bool,
    ) -> Result<KeyMaterial> {
        self.generate_and_wrap(session, user_id, key_size, is_ecc, archive)
            .await
            .inspect_err(|e| {
                self.report(
                    "KeyLifecycleOrchestrator::server_side_key_gen",
                    "Server-side key generation failed",
                    session,
                    user_id,
                    e,
                )
            })
    }

    async fn generate_and_wrap(
        &self,
        session: &Session,
        user_id: &str,
        key_size: u32,
        is_ecc: bool,
        archive: bool,
    ) -> Result<KeyMaterial> {
        let spec = KeySpec::new(key_size, is_ecc)?;
        let keys = session.keys()?;

        self.diagnostics.debug(
            LogLevel::PerConnection,
            "KeyLifecycleOrchestrator::server_side_key_gen",
            "Generating key pair",
            &[
                ("session", &session.id()),
                ("user", &user_id),
                ("key_type", &spec.key_type),
                ("key_size", &spec.key_size),
                ("archive", &archive),
            ],
        );

        let pair = self.generate(spec).await?;
        let blob = wrap(&keys.kek, &pair.private_key_der)?;
        let public_key = STANDARD.encode(&pair.public_key_der);
        drop(pair);

        let receipt = if archive {
            Some(self.archive(session, user_id, &spec, &public_key, &blob).await?)
        } else {
            None
        };

        Ok(KeyMaterial {
            session_id: session.id(),
            spec: Some(spec),
            public_key,
            wrapped_private_key: blob.ciphertext,
            iv_param: blob.iv,
            key_check_value: keys.key_check_value,
            archive: receipt,
        })
    }

    async fn generate(&self, spec: KeySpec) -> Result<GeneratedKeyPair> {
        // Prime search for large RSA moduli takes seconds
        let generator = Arc::clone(&self.generator);
        tokio::task::spawn_blocking(move || generator.generate(&spec))
            .await
            .map_err(|e| RaError::KeyGenFailure(format!("Key generation task failed: {}", e)))?
    }

    async fn archive(
        &self,
        session: &Session,
        user_id: &str,
        spec: &KeySpec,
        public_key: &str,
        blob: &WrappedBlob,
    ) -> Result<ArchiveReceipt> {
        let drm_wrapped_kek = drm_wrapped_kek(session)?;

        let request = BackendRequest::new(BackendOp::ArchiveKey)
            .hex_param(fields::CUID, session.cuid())
            .param(fields::USER_ID, user_id)
            .hex_param(fields::DRM_TRANS_KEY, drm_wrapped_kek)
            .hex_param(fields::WRAPPED_PRIVATE_KEY, &blob.ciphertext)
            .hex_param(fields::IV_PARAM, &blob.iv)
            .param(fields::PUBLIC_KEY, public_key)
            .param(fields::KEY_TYPE, spec.key_type.as_str())
            .param(fields::KEY_SIZE, spec.key_size.to_string());

        let served = self.send_drm(request).await?;
        served.value.ensure_ok(BackendKind::Drm)?;

        self.diagnostics.debug(
            LogLevel::PerConnection,
            "KeyLifecycleOrchestrator::archive",
            "Private key archived",
            &[
                ("session", &session.id()),
                ("user", &user_id),
                ("drm", &served.endpoint),
                ("failovers", &served.failovers()),
            ],
        );

        Ok(ArchiveReceipt {
            key_id: served.value.get(fields::KEY_ID).map(str::to_string),
            failovers: served.failovers(),
            endpoint: served.endpoint,
        })
    }

    /// Recover the escrowed private key for `certificate`.
    ///
    /// The DRM re-wraps the archived key under the session KEK. The result
    /// must unwrap under `kek_session_key`; if it doesn't, the caller's KEK
    /// and the session disagree and the material is rejected.
    pub async fn recover_key(
        &self,
        session: &Session,
        user_id: &str,
        certificate: &CertificateRecord,
        kek_session_key: &SymKey,
    ) -> Result<KeyMaterial> {
        self.recover(session, user_id, certificate, kek_session_key)
            .await
            .inspect_err(|e| {
                self.report(
                    "KeyLifecycleOrchestrator::recover_key",
                    "Key recovery failed",
                    session,
                    user_id,
                    e,
                )
            })
    }

    async fn recover(
        &self,
        session: &Session,
        user_id: &str,
        certificate: &CertificateRecord,
        kek_session_key: &SymKey,
    ) -> Result<KeyMaterial> {
        let keys = session.keys()?;
        let drm_wrapped_kek = drm_wrapped_kek(session)?;

        self.diagnostics.debug(
            LogLevel::PerConnection,
            "KeyLifecycleOrchestrator::recover_key",
            "Recovering archived key",
            &[("session", &session.id()), ("user", &user_id)],
        );

        let request = BackendRequest::new(BackendOp::RecoverKey)
            .hex_param(fields::CUID, session.cuid())
            .param(fields::USER_ID, user_id)
            .param(fields::CERT, certificate.certificate.as_str())
            .param(fields::PUBLIC_KEY, certificate.public_key.as_str())
            .hex_param(fields::DRM_TRANS_KEY, drm_wrapped_kek);

        let served = self.send_drm(request).await?;
        let response = &served.value;
        if response.status() == Some(STATUS_NO_SUCH_KEY) {
            return Err(RaError::KeyNotFound(format!(
                "No archived key for {}'s certificate",
                user_id
            )));
        }
        response.ensure_ok(BackendKind::Drm)?;

        let public_key = response.require(fields::PUBLIC_KEY)?;
        if public_key != certificate.public_key {
            return Err(RaError::ProtocolViolation(
                "DRM returned a key for a different certificate".into(),
            ));
        }
        let iv: [u8; NONCE_LEN] = response
            .require_hex(fields::IV_PARAM)?
            .try_into()
            .map_err(|_| RaError::ProtocolViolation(format!("DRM iv_param is not {} bytes", NONCE_LEN)))?;
        let blob = WrappedBlob {
            iv,
            ciphertext: response.require_hex(fields::WRAPPED_PRIV_KEY)?,
        };

        // Plaintext is dropped (and zeroized) straight away
        unwrap(kek_session_key, &blob).map_err(|_| {
            RaError::CryptoFailure(
                "Recovered key does not unwrap under the session KEK (KEK/session mismatch)".into(),
            )
        })?;

        let spec = match (
            response.get(fields::KEY_TYPE).and_then(KeyType::parse),
            response.get(fields::KEY_SIZE).and_then(|s| s.parse::<u32>().ok()),
        ) {
            (Some(key_type), Some(size)) => KeySpec::new(size, key_type == KeyType::Ec).ok(),
            _ => None,
        };

        self.diagnostics.debug(
            LogLevel::PerConnection,
            "KeyLifecycleOrchestrator::recover_key",
            "Archived key recovered",
            &[
                ("session", &session.id()),
                ("user", &user_id),
                ("drm", &served.endpoint),
                ("failovers", &served.failovers()),
            ],
        );

        Ok(KeyMaterial {
            session_id: session.id(),
            spec,
            public_key: public_key.to_string(),
            wrapped_private_key: blob.ciphertext,
            iv_param: blob.iv,
            key_check_value: keys.key_check_value,
            archive: None,
        })
    }

    fn report(&self, func: &str, message: &str, session: &Session, user_id: &str, error: &RaError) {
        self.diagnostics.error(
            LogLevel::PerConnection,
            func,
            message,
            &[
                ("session", &session.id()),
                ("user", &user_id),
                ("error", error),
                ("kind", &error.kind()),
            ],
        );
    }

    async fn send_drm(&self, request: BackendRequest) -> Result<Served<BackendResponse>> {
        let request = &request;
        self.pools
            .pool(BackendKind::Drm)
            .call_with_failover(|conn: Arc<dyn BackendTransport>| async move {
                conn.send(request.clone()).await
            })
            .await
    }
}

/// The session KEK as wrapped for the DRM.
///
/// A TKS-derived session without one means the TKS answered without the
/// field; a locally derived one means no DRM transport key was loaded.
fn drm_wrapped_kek(session: &Session) -> Result<&[u8]> {
    let keys = session.keys()?;
    keys.drm_wrapped_kek.as_deref().ok_or_else(|| match session.connection_id() {
        Some(tks) if tks != LOCAL_CONNECTION_ID => RaError::ProtocolViolation(format!(
            "TKS {} returned no '{}'",
            tks,
            fields::DRM_TRANS_DES_KEY
        )),
        _ => RaError::Configuration(
            "Session KEK was not wrapped for the DRM; DRM_TRANSPORT_KEY is not loaded".into(),
        ),
    })
}
