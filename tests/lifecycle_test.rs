//! Key lifecycle integration tests
//!
//! Server-side key generation, DRM archival with failover, and recovery of
//! archived keys into a new session.

mod common;

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::*;
use token_ra::backend::BackendKind;
use token_ra::keys::{unwrap, SymKey};
use token_ra::lifecycle::{
    CertificateRecord, KeySpec, KeyType, MockKeyGenerator, SoftwareKeyGenerator,
};
use token_ra::RaError;

const CERT_B64: &str = "MIIBszCCAVmgAwIBAgIUVGVzdENlcnQ=";

// =============================================================================
// Server-side key generation
// =============================================================================

#[tokio::test]
async fn test_keygen_without_archive_never_touches_drm() {
    // Scenario A: RSA-2048, archive=false
    let tks = tks_mocks(1, 0);
    let (archive, drm) = drm_mocks(2, 0);
    let ctx = context(&tks, &drm);
    let session = derived_session(&ctx, &HOST_CHALLENGE).await;
    assert_eq!(session.cuid().len(), 16);

    let material = ctx
        .orchestrator()
        .server_side_key_gen(&session, "alice", 2048, false, false)
        .await
        .unwrap();

    assert_eq!(
        material.spec,
        Some(KeySpec {
            key_type: KeyType::Rsa,
            key_size: 2048
        })
    );
    assert!(!material.public_key.is_empty());
    assert!(!material.wrapped_private_key.is_empty());
    assert!(material.archive.is_none());
    assert_eq!(material.session_id, session.id());
    assert_eq!(material.key_check_value, session.keys().unwrap().key_check_value);

    // Private key unwraps under the session KEK
    let spec = KeySpec::new(2048, false).unwrap();
    let private = unwrap(&session.keys().unwrap().kek, &material.wrapped_blob()).unwrap();
    assert_eq!(*private, MockKeyGenerator::private_key_for(&spec, 1));

    assert!(archive.is_empty());
    assert!(drm.iter().all(|d| d.call_count() == 0));
}

#[tokio::test]
async fn test_archive_fails_over_to_second_drm() {
    // Scenario B: 2 DRM connections, first unreachable
    let tks = tks_mocks(1, 0);
    let (archive, drm) = drm_mocks(2, 1);
    let ctx = context(&tks, &drm);
    let session = derived_session(&ctx, &HOST_CHALLENGE).await;

    let material = ctx
        .orchestrator()
        .server_side_key_gen(&session, "alice", 2048, false, true)
        .await
        .unwrap();

    let receipt = material.archive.expect("archived");
    assert_eq!(receipt.endpoint, "drm-1");
    assert_eq!(receipt.failovers, 1);
    assert_eq!(receipt.key_id.as_deref(), Some(material.public_key.as_str()));
    assert_eq!(drm[0].call_count(), 1);
    assert_eq!(drm[1].call_count(), 1);
    assert_eq!(ctx.pools().pool(BackendKind::Drm).failover_count(), 1);
    assert_eq!(archive.len(), 1);
}

#[tokio::test]
async fn test_archive_with_all_drm_down_is_exhausted() {
    let tks = tks_mocks(1, 0);
    let (archive, drm) = drm_mocks(2, 2);
    let ctx = context(&tks, &drm);
    let session = derived_session(&ctx, &HOST_CHALLENGE).await;

    let err = ctx
        .orchestrator()
        .server_side_key_gen(&session, "alice", 2048, false, true)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RaError::BackendExhausted {
            kind: BackendKind::Drm,
            attempts: 2
        }
    ));
    assert!(archive.is_empty());
}

#[tokio::test]
async fn test_keygen_rejects_unsupported_parameters() {
    let tks = tks_mocks(1, 0);
    let (_, drm) = drm_mocks(1, 0);
    let ctx = context(&tks, &drm);
    let session = derived_session(&ctx, &HOST_CHALLENGE).await;
    let orchestrator = ctx.orchestrator();

    for (size, ecc) in [(512, false), (2047, false), (384, true)] {
        let err = orchestrator
            .server_side_key_gen(&session, "alice", size, ecc, true)
            .await
            .unwrap_err();
        assert!(matches!(err, RaError::KeyGenFailure(_)), "size={} ecc={}", size, ecc);
    }
    assert_eq!(drm[0].call_count(), 0);
}

// =============================================================================
// Recovery
// =============================================================================

#[tokio::test]
async fn test_recover_round_trip_into_new_session() {
    let tks = tks_mocks(1, 0);
    let (_, drm) = drm_mocks(1, 0);
    let ctx = context(&tks, &drm);
    let orchestrator = ctx.orchestrator();

    let first = derived_session(&ctx, &HOST_CHALLENGE).await;
    let generated = orchestrator
        .server_side_key_gen(&first, "alice", 2048, false, true)
        .await
        .unwrap();
    let original = unwrap(&first.keys().unwrap().kek, &generated.wrapped_blob()).unwrap();

    // A later token interaction with its own challenges and KEK
    let second = derived_session(&ctx, &[0x99; 8]).await;
    let second_kek = second.keys().unwrap().kek.clone();
    assert_ne!(second_kek, first.keys().unwrap().kek);

    let cert = CertificateRecord::new(CERT_B64, generated.public_key.clone());
    let recovered = orchestrator
        .recover_key(&second, "alice", &cert, &second_kek)
        .await
        .unwrap();

    assert_eq!(recovered.public_key, generated.public_key);
    assert_eq!(recovered.session_id, second.id());
    assert_eq!(recovered.spec, generated.spec);
    let unwrapped = unwrap(&second_kek, &recovered.wrapped_blob()).unwrap();
    assert_eq!(*unwrapped, *original);

    // And under the original session's KEK
    let again = orchestrator
        .recover_key(&first, "alice", &cert, &first.keys().unwrap().kek)
        .await
        .unwrap();
    let unwrapped = unwrap(&first.keys().unwrap().kek, &again.wrapped_blob()).unwrap();
    assert_eq!(*unwrapped, *original);
}

#[tokio::test]
async fn test_recover_unknown_certificate_is_key_not_found() {
    let tks = tks_mocks(1, 0);
    let (_, drm) = drm_mocks(1, 0);
    let ctx = context(&tks, &drm);
    let session = derived_session(&ctx, &HOST_CHALLENGE).await;
    let kek = session.keys().unwrap().kek.clone();

    let err = ctx
        .orchestrator()
        .recover_key(
            &session,
            "bob",
            &CertificateRecord::new(CERT_B64, STANDARD.encode(b"not archived")),
            &kek,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RaError::KeyNotFound(_)));
}

#[tokio::test]
async fn test_recover_with_foreign_kek_is_crypto_failure() {
    let tks = tks_mocks(1, 0);
    let (_, drm) = drm_mocks(1, 0);
    let ctx = context(&tks, &drm);
    let session = derived_session(&ctx, &HOST_CHALLENGE).await;
    let generated = ctx
        .orchestrator()
        .server_side_key_gen(&session, "alice", 1024, false, true)
        .await
        .unwrap();

    let cert = CertificateRecord::new(CERT_B64, generated.public_key);
    let err = ctx
        .orchestrator()
        .recover_key(&session, "alice", &cert, &SymKey::from_bytes([0xEE; 32]))
        .await
        .unwrap_err();

    assert!(matches!(err, RaError::CryptoFailure(_)));
}

#[tokio::test]
async fn test_lifecycle_failures_are_logged_as_errors() {
    let tks = tks_mocks(1, 0);
    let (_, drm) = drm_mocks(1, 0);
    let sink = Arc::new(RecordingSink::default());
    let ctx = recorded_context(&tks, &drm, Arc::clone(&sink));
    let session = derived_session(&ctx, &HOST_CHALLENGE).await;
    let generated = ctx
        .orchestrator()
        .server_side_key_gen(&session, "alice", 1024, false, true)
        .await
        .unwrap();
    assert!(sink.errors().is_empty());

    let cert = CertificateRecord::new(CERT_B64, generated.public_key);
    ctx.orchestrator()
        .recover_key(&session, "alice", &cert, &SymKey::from_bytes([0xEE; 32]))
        .await
        .unwrap_err();
    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("E KeyLifecycleOrchestrator::recover_key Key recovery failed"));
    assert!(errors[0].contains("kind=crypto_failure"));
    assert!(errors[0].contains("user=alice"));

    ctx.orchestrator()
        .recover_key(
            &session,
            "bob",
            &CertificateRecord::new(CERT_B64, "bm9wZQ=="),
            &SymKey::from_bytes([0xEE; 32]),
        )
        .await
        .unwrap_err();
    assert!(sink.errors()[1].contains("kind=key_not_found"));

    ctx.orchestrator()
        .server_side_key_gen(&session, "alice", 1000, false, false)
        .await
        .unwrap_err();
    let errors = sink.errors();
    assert_eq!(errors.len(), 3);
    assert!(errors[2].starts_with("E KeyLifecycleOrchestrator::server_side_key_gen"));
    assert!(errors[2].contains("kind=keygen_failure"));
}

#[tokio::test]
async fn test_recover_fails_over_and_exhausts() {
    let tks = tks_mocks(1, 0);
    let (_, drm) = drm_mocks(3, 0);
    let ctx = context(&tks, &drm);
    let session = derived_session(&ctx, &HOST_CHALLENGE).await;
    let kek = session.keys().unwrap().kek.clone();
    let generated = ctx
        .orchestrator()
        .server_side_key_gen(&session, "alice", 2048, false, true)
        .await
        .unwrap();
    let cert = CertificateRecord::new(CERT_B64, generated.public_key);

    drm[1].set_available(false);
    drm[2].set_available(false);
    // Cursor now points at drm-1: fails over through drm-2 to drm-0
    let recovered = ctx
        .orchestrator()
        .recover_key(&session, "alice", &cert, &kek)
        .await
        .unwrap();
    assert_eq!(recovered.public_key, cert.public_key);

    drm[0].set_available(false);
    let err = ctx
        .orchestrator()
        .recover_key(&session, "alice", &cert, &kek)
        .await
        .unwrap_err();
    assert!(matches!(err, RaError::BackendExhausted { attempts: 3, .. }));
}

// =============================================================================
// Software generator end to end
// =============================================================================

#[tokio::test]
async fn test_p256_keygen_archive_and_recover() {
    let tks = tks_mocks(1, 0);
    let (_, drm) = drm_mocks(1, 0);
    let ctx = context(&tks, &drm).with_generator(Arc::new(SoftwareKeyGenerator));
    let session = derived_session(&ctx, &HOST_CHALLENGE).await;
    let kek = session.keys().unwrap().kek.clone();

    let generated = ctx
        .orchestrator()
        .server_side_key_gen(&session, "carol", 256, true, true)
        .await
        .unwrap();
    let public_der = STANDARD.decode(&generated.public_key).unwrap();
    let private_der = unwrap(&kek, &generated.wrapped_blob()).unwrap();

    use p256::pkcs8::{DecodePrivateKey, DecodePublicKey};
    let public = p256::PublicKey::from_public_key_der(&public_der).unwrap();
    let secret = p256::SecretKey::from_pkcs8_der(&private_der).unwrap();
    assert_eq!(secret.public_key(), public);

    let recovered = ctx
        .orchestrator()
        .recover_key(
            &session,
            "carol",
            &CertificateRecord::new(CERT_B64, generated.public_key.clone()),
            &kek,
        )
        .await
        .unwrap();
    assert_eq!(*unwrap(&kek, &recovered.wrapped_blob()).unwrap(), *private_der);
    assert_eq!(recovered.spec.map(|s| s.key_type), Some(KeyType::Ec));
}
