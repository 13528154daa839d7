//! Shared fixtures for integration tests: mock backends wired into a context.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use token_ra::backend::mock::{DrmArchive, MockDrm, MockTks};
use token_ra::backend::{BackendKind, BackendTransport};
use token_ra::channel::{
    compute_card_cryptogram, derive_local_session_keys, Algorithm, Challenge, ChannelParams,
    Cryptogram,
};
use token_ra::config::ConfigSnapshot;
use token_ra::diagnostics::{DiagEvent, Diagnostics, DiagnosticsSink, LogLevel};
use token_ra::keys::{KeyStore, SymKey, DRM_TRANSPORT_KEY_NAME, TRANSPORT_KEY_NAME};
use token_ra::lifecycle::MockKeyGenerator;
use token_ra::pool::{BackendPools, ConnectionPool};
use token_ra::session::Session;
use token_ra::RaContext;

pub const MASTER: [u8; 32] = [0x40; 32];
pub const TRANSPORT: [u8; 32] = [0x55; 32];
pub const DRM_TRANSPORT: [u8; 32] = [0x77; 32];

pub const CUID: [u8; 16] = [
    0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0, 0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF,
];
pub const KEY_INFO: [u8; 2] = [0x01, 0x01];
pub const CARD_CHALLENGE: Challenge = [0xC1, 0xC2, 0xC3, 0xC4, 0xC5, 0xC6, 0xC7, 0xC8];
pub const HOST_CHALLENGE: Challenge = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];

/// The cryptogram a genuine card holding keys diversified from `MASTER`
/// would answer with.
pub fn card_cryptogram(card_challenge: &Challenge, host_challenge: &Challenge) -> Cryptogram {
    let params = ChannelParams {
        cuid: &CUID,
        key_info: &KEY_INFO,
        card_challenge,
        host_challenge,
        card_cryptogram: &[0; 8],
        key_set: "defKeySet",
    };
    let (_, enc, _) = derive_local_session_keys(&SymKey::from_bytes(MASTER), &params).unwrap();
    compute_card_cryptogram(&enc, card_challenge, host_challenge).unwrap()
}

/// A session whose card cryptogram is valid for `host_challenge`.
pub fn session_for(host_challenge: &Challenge, algorithm: Algorithm) -> Session {
    let cc = card_cryptogram(&CARD_CHALLENGE, host_challenge);
    Session::new(&CUID, &KEY_INFO, &CARD_CHALLENGE, &cc, algorithm).unwrap()
}

pub fn mock_tks(id: &str, available: bool) -> Arc<MockTks> {
    Arc::new(
        MockTks::new(id, SymKey::from_bytes(MASTER), SymKey::from_bytes(TRANSPORT))
            .with_drm_transport_key(SymKey::from_bytes(DRM_TRANSPORT))
            .with_available(available),
    )
}

/// `n` TKS mocks, the first `failing` of them unreachable
pub fn tks_mocks(n: usize, failing: usize) -> Vec<Arc<MockTks>> {
    (0..n)
        .map(|i| mock_tks(&format!("tks-{}", i), i >= failing))
        .collect()
}

/// `n` DRM mocks sharing one archive, the first `failing` of them unreachable
pub fn drm_mocks(n: usize, failing: usize) -> (Arc<DrmArchive>, Vec<Arc<MockDrm>>) {
    let archive = DrmArchive::new(SymKey::from_bytes(DRM_TRANSPORT));
    let mocks = (0..n)
        .map(|i| {
            Arc::new(MockDrm::new(format!("drm-{}", i), Arc::clone(&archive)).with_available(i >= failing))
        })
        .collect();
    (archive, mocks)
}

pub fn slots<T: BackendTransport + 'static>(mocks: &[Arc<T>]) -> Vec<Arc<dyn BackendTransport>> {
    mocks
        .iter()
        .map(|m| Arc::clone(m) as Arc<dyn BackendTransport>)
        .collect()
}

pub fn key_store() -> KeyStore {
    KeyStore::new()
        .with_key(TRANSPORT_KEY_NAME, SymKey::from_bytes(TRANSPORT))
        .with_key(DRM_TRANSPORT_KEY_NAME, SymKey::from_bytes(DRM_TRANSPORT))
}

/// Sink keeping one `"<D|E> <func> <message>"` line per event.
#[derive(Default)]
pub struct RecordingSink {
    pub lines: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn push(&self, line: String) {
        self.lines.lock().unwrap().push(line);
    }

    pub fn errors(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("E "))
            .cloned()
            .collect()
    }
}

impl DiagnosticsSink for RecordingSink {
    fn debug(&self, event: &DiagEvent<'_>) {
        self.push(format!("D {} {} {}", event.func, event.message, event.render_fields()));
    }

    fn error(&self, event: &DiagEvent<'_>) {
        self.push(format!("E {} {} {}", event.func, event.message, event.render_fields()));
    }

    fn debug_buffer(&self, _level: LogLevel, func: &str, prefix: &str, buf: &[u8]) {
        self.push(format!("D {} {}{}", func, prefix, hex::encode_upper(buf)));
    }
}

/// Context over mock pools, with the instant mock key generator.
pub fn context(tks: &[Arc<MockTks>], drm: &[Arc<MockDrm>]) -> RaContext {
    context_with_diagnostics(tks, drm, Diagnostics::default())
}

/// Same as `context`, reporting to `sink` at every level.
pub fn recorded_context(
    tks: &[Arc<MockTks>],
    drm: &[Arc<MockDrm>],
    sink: Arc<RecordingSink>,
) -> RaContext {
    let diagnostics = Diagnostics::new(sink, LogLevel::AllDataInPdu, LogLevel::AllDataInPdu);
    context_with_diagnostics(tks, drm, diagnostics)
}

fn context_with_diagnostics(
    tks: &[Arc<MockTks>],
    drm: &[Arc<MockDrm>],
    diagnostics: Diagnostics,
) -> RaContext {
    let pools = BackendPools::new(
        ConnectionPool::new(BackendKind::Tks, slots(tks)),
        ConnectionPool::new(BackendKind::Ca, Vec::new()),
        ConnectionPool::new(BackendKind::Drm, slots(drm)),
    )
    .unwrap();
    RaContext::new(ConfigSnapshot::empty(), pools, key_store(), diagnostics)
        .with_generator(Arc::new(MockKeyGenerator::new()))
}

/// A session already derived through a single healthy TKS.
pub async fn derived_session(ctx: &RaContext, host_challenge: &Challenge) -> Session {
    let mut session = session_for(host_challenge, Algorithm::Rsa);
    ctx.deriver()
        .derive(&mut session, Some(*host_challenge))
        .await
        .unwrap();
    session
}
