//! Mock TKS and DRM backends for testing.
//!
//! Both speak the same field protocol as the real servlets and implement the
//! same key schedule, so the engine's validation runs unmodified against them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use zeroize::Zeroizing;

use super::{
    fields, BackendKind, BackendOp, BackendRequest, BackendResponse, BackendTransport,
    STATUS_NO_SUCH_KEY,
};
use crate::channel::crypto::{compute_host_cryptogram, derive_local_session_keys, ChannelParams};
use crate::keys::{key_check_value, unwrap, unwrap_sym_key, wrap, wrap_sym_key, SymKey, WrappedBlob};
use crate::types::{RaError, Result};

fn hex_param(request: &BackendRequest, name: &str) -> Result<Vec<u8>> {
    let value = request
        .get(name)
        .ok_or_else(|| RaError::ProtocolViolation(format!("Request missing '{}'", name)))?;
    Ok(hex::decode(value)?)
}

fn error_response(status: &str, message: impl Into<String>) -> BackendResponse {
    BackendResponse::new()
        .with(fields::STATUS, status)
        .with(fields::ERROR, message)
}

// =============================================================================
// Mock TKS
// =============================================================================

/// Mock Token Key Service holding a master key.
pub struct MockTks {
    id: String,
    master: SymKey,
    transport: SymKey,
    drm_transport: Option<SymKey>,
    available: AtomicBool,
    forced_status: Option<String>,
    corrupt_host_cryptogram: bool,
    call_count: AtomicU32,
}

impl MockTks {
    /// Create a mock TKS that wraps session keys under `transport`.
    pub fn new(id: impl Into<String>, master: SymKey, transport: SymKey) -> Self {
        Self {
            id: id.into(),
            master,
            transport,
            drm_transport: None,
            available: AtomicBool::new(true),
            forced_status: None,
            corrupt_host_cryptogram: false,
            call_count: AtomicU32::new(0),
        }
    }

    /// Also return the KEK wrapped for the DRM.
    pub fn with_drm_transport_key(mut self, key: SymKey) -> Self {
        self.drm_transport = Some(key);
        self
    }

    /// Set availability. Unavailable mocks fail every call at connection level.
    pub fn with_available(self, available: bool) -> Self {
        self.available.store(available, Ordering::SeqCst);
        self
    }

    /// Answer every request with this status instead of computing keys.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.forced_status = Some(status.into());
        self
    }

    /// Flip a bit in the returned host cryptogram.
    pub fn with_corrupt_host_cryptogram(mut self) -> Self {
        self.corrupt_host_cryptogram = true;
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Get the number of times send was called.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    fn compute_session_key(&self, request: &BackendRequest) -> Result<BackendResponse> {
        let cuid = hex_param(request, fields::CUID)?;
        let key_info = hex_param(request, fields::KDD)?;
        let card_challenge = hex_param(request, fields::CARD_CHALLENGE)?;
        let host_challenge = hex_param(request, fields::HOST_CHALLENGE)?;
        let card_cryptogram = hex_param(request, fields::CARD_CRYPTOGRAM)?;
        let params = ChannelParams {
            cuid: &cuid,
            key_info: &key_info,
            card_challenge: &card_challenge,
            host_challenge: &host_challenge,
            card_cryptogram: &card_cryptogram,
            key_set: request.get(fields::KEY_SET).unwrap_or_default(),
        };
        if params.validate().is_err() {
            return Ok(error_response("1", "invalid challenge set"));
        }

        let (mac_key, enc_key, kek) = derive_local_session_keys(&self.master, &params)?;
        let mut host_cryptogram = compute_host_cryptogram(&enc_key, &card_challenge, &host_challenge)?;
        if self.corrupt_host_cryptogram {
            host_cryptogram[0] ^= 0x80;
        }

        let mut response = BackendResponse::ok()
            .with_hex(fields::SESSION_KEY, &wrap_sym_key(&self.transport, &mac_key)?)
            .with_hex(fields::ENC_SESSION_KEY, &wrap_sym_key(&self.transport, &enc_key)?)
            .with_hex(fields::KEK_DES_KEY, &wrap_sym_key(&self.transport, &kek)?)
            .with_hex(fields::HOST_CRYPTOGRAM, &host_cryptogram)
            .with_hex(fields::KEY_CHECK, &key_check_value(&kek)?);
        if let Some(drm_key) = &self.drm_transport {
            response = response.with_hex(fields::DRM_TRANS_DES_KEY, &wrap_sym_key(drm_key, &kek)?);
        }
        Ok(response)
    }
}

#[async_trait]
impl BackendTransport for MockTks {
    fn endpoint(&self) -> &str {
        &self.id
    }

    async fn send(&self, request: BackendRequest) -> Result<BackendResponse> {
        self.call_count.fetch_add(1, Ordering::SeqCst);

        if !self.available.load(Ordering::SeqCst) {
            return Err(RaError::connection(
                BackendKind::Tks,
                format!("{} unreachable", self.id),
            ));
        }
        if let Some(status) = &self.forced_status {
            return Ok(error_response(status, "forced by test"));
        }
        match request.op {
            BackendOp::ComputeSessionKey => self.compute_session_key(&request),
            other => Ok(error_response("1", format!("unsupported op {:?}", other))),
        }
    }
}

// =============================================================================
// Mock DRM
// =============================================================================

struct ArchivedKey {
    private_key: Zeroizing<Vec<u8>>,
    key_type: String,
    key_size: String,
}

/// Escrow storage shared by every mock DRM connection of one pool.
pub struct DrmArchive {
    transport: SymKey,
    // public key (base64 SPKI) -> archived private key
    entries: Mutex<HashMap<String, ArchivedKey>>,
}

impl DrmArchive {
    pub fn new(transport: SymKey) -> Arc<Self> {
        Arc::new(Self {
            transport,
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn session_kek(&self, request: &BackendRequest) -> Result<SymKey> {
        unwrap_sym_key(&self.transport, &hex_param(request, fields::DRM_TRANS_KEY)?)
    }

    fn archive(&self, request: &BackendRequest) -> Result<BackendResponse> {
        let kek = match self.session_kek(request) {
            Ok(kek) => kek,
            Err(_) => return Ok(error_response("1", "transport key unwrap failed")),
        };
        let blob = WrappedBlob {
            iv: hex_param(request, fields::IV_PARAM)?
                .try_into()
                .map_err(|_| RaError::ProtocolViolation("Bad IV length".into()))?,
            ciphertext: hex_param(request, fields::WRAPPED_PRIVATE_KEY)?,
        };
        let private_key = match unwrap(&kek, &blob) {
            Ok(pk) => pk,
            Err(_) => return Ok(error_response("1", "private key unwrap failed")),
        };
        let public_key = request
            .get(fields::PUBLIC_KEY)
            .ok_or_else(|| RaError::ProtocolViolation("Request missing 'public_key'".into()))?
            .to_string();

        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                public_key.clone(),
                ArchivedKey {
                    private_key,
                    key_type: request.get(fields::KEY_TYPE).unwrap_or_default().to_string(),
                    key_size: request.get(fields::KEY_SIZE).unwrap_or_default().to_string(),
                },
            );

        Ok(BackendResponse::ok().with(fields::KEY_ID, public_key))
    }

    fn recover(&self, request: &BackendRequest) -> Result<BackendResponse> {
        let public_key = request.get(fields::PUBLIC_KEY).unwrap_or_default();
        let kek = match self.session_kek(request) {
            Ok(kek) => kek,
            Err(_) => return Ok(error_response("1", "transport key unwrap failed")),
        };

        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(archived) = entries.get(public_key) else {
            return Ok(error_response(STATUS_NO_SUCH_KEY, "no archived key for certificate"));
        };
        let blob = wrap(&kek, &archived.private_key)?;

        Ok(BackendResponse::ok()
            .with(fields::PUBLIC_KEY, public_key)
            .with(fields::KEY_TYPE, archived.key_type.as_str())
            .with(fields::KEY_SIZE, archived.key_size.as_str())
            .with_hex(fields::WRAPPED_PRIV_KEY, &blob.ciphertext)
            .with_hex(fields::IV_PARAM, &blob.iv))
    }
}

/// Mock Data Recovery Manager connection.
pub struct MockDrm {
    id: String,
    archive: Arc<DrmArchive>,
    available: AtomicBool,
    call_count: AtomicU32,
}

impl MockDrm {
    pub fn new(id: impl Into<String>, archive: Arc<DrmArchive>) -> Self {
        Self {
            id: id.into(),
            archive,
            available: AtomicBool::new(true),
            call_count: AtomicU32::new(0),
        }
    }

    /// Set availability. Unavailable mocks fail every call at connection level.
    pub fn with_available(self, available: bool) -> Self {
        self.available.store(available, Ordering::SeqCst);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Get the number of times send was called.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendTransport for MockDrm {
    fn endpoint(&self) -> &str {
        &self.id
    }

    async fn send(&self, request: BackendRequest) -> Result<BackendResponse> {
        self.call_count.fetch_add(1, Ordering::SeqCst);

        if !self.available.load(Ordering::SeqCst) {
            return Err(RaError::connection(
                BackendKind::Drm,
                format!("{} unreachable", self.id),
            ));
        }
        match request.op {
            BackendOp::ArchiveKey => self.archive.archive(&request),
            BackendOp::RecoverKey => self.archive.recover(&request),
            other => Ok(error_response("1", format!("unsupported op {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_tks_unavailable() {
        let tks = MockTks::new("tks-0", SymKey::from_bytes([1; 32]), SymKey::from_bytes([2; 32]))
            .with_available(false);
        let err = tks
            .send(BackendRequest::new(BackendOp::ComputeSessionKey))
            .await
            .unwrap_err();
        assert!(err.is_connection_level());
        assert_eq!(tks.call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_tks_rejects_bad_challenges() {
        let tks = MockTks::new("tks-0", SymKey::from_bytes([1; 32]), SymKey::from_bytes([2; 32]));
        let request = BackendRequest::new(BackendOp::ComputeSessionKey)
            .hex_param(fields::CUID, &[1; 10])
            .hex_param(fields::KDD, &[1])
            .hex_param(fields::CARD_CHALLENGE, &[1; 3])
            .hex_param(fields::HOST_CHALLENGE, &[1; 8])
            .hex_param(fields::CARD_CRYPTOGRAM, &[1; 8]);
        let response = tks.send(request).await.unwrap();
        assert_eq!(response.status(), Some("1"));
    }

    #[test]
    fn test_mock_drm_unknown_key() {
        let transport = SymKey::from_bytes([3; 32]);
        let kek = SymKey::from_bytes([4; 32]);
        let drm = MockDrm::new("drm-0", DrmArchive::new(transport.clone()));
        let request = BackendRequest::new(BackendOp::RecoverKey)
            .param(fields::PUBLIC_KEY, "nope")
            .hex_param(fields::DRM_TRANS_KEY, &wrap_sym_key(&transport, &kek).unwrap());
        let response = tokio_test::block_on(drm.send(request)).unwrap();
        assert_eq!(response.status(), Some(STATUS_NO_SUCH_KEY));
    }
}
