//! Diagnostics integration tests
//!
//! Engine operations tag their events with severity tiers; the buffered file
//! sink only sees what the thresholds let through.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tempfile::TempDir;
use token_ra::backend::BackendKind;
use token_ra::channel::Algorithm;
use token_ra::config::ConfigSnapshot;
use token_ra::diagnostics::{spawn_flush_task, BufferedLogFile, Diagnostics, FileSink, LogLevel};
use token_ra::pool::{BackendPools, ConnectionPool};
use token_ra::RaContext;

fn file_context(
    tks: &[Arc<token_ra::backend::mock::MockTks>],
    file: Arc<BufferedLogFile>,
    debug_level: LogLevel,
) -> RaContext {
    let diagnostics = Diagnostics::new(Arc::new(FileSink::new(file)), debug_level, LogLevel::AllDataInPdu);
    let pools = BackendPools::new(
        ConnectionPool::with_diagnostics(BackendKind::Tks, slots(tks), diagnostics.clone()),
        ConnectionPool::new(BackendKind::Ca, Vec::new()),
        ConnectionPool::new(BackendKind::Drm, Vec::new()),
    )
    .unwrap();
    RaContext::new(ConfigSnapshot::empty(), pools, key_store(), diagnostics)
}

#[tokio::test]
async fn test_failover_and_derivation_are_logged_by_tier() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ra-debug.log");
    let file = Arc::new(BufferedLogFile::open(&path, 1 << 20).unwrap());
    let flush = spawn_flush_task(Arc::clone(&file), Duration::from_secs(3600));

    let tks = tks_mocks(2, 1);
    let ctx = file_context(&tks, Arc::clone(&file), LogLevel::PerConnection);
    let mut session = session_for(&HOST_CHALLENGE, Algorithm::Rsa);
    ctx.deriver()
        .derive(&mut session, Some(HOST_CHALLENGE))
        .await
        .unwrap();
    flush.shutdown().await;

    let log = std::fs::read_to_string(&path).unwrap();
    assert!(log.contains("ERROR 4 ConnectionPool::failover: Failing over to next connection"));
    assert!(log.contains("DEBUG 6 SessionKeyDeriver::derive: Session keys derived"));
    // Per-PDU events sit above the debug threshold
    assert!(!log.contains("DEBUG 8"));
    assert!(!log.contains("host_challenge="));
}

#[tokio::test]
async fn test_full_dump_tier_includes_challenges() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ra-debug.log");
    let file = Arc::new(BufferedLogFile::open(&path, 1 << 20).unwrap());

    let tks = tks_mocks(1, 0);
    let ctx = file_context(&tks, Arc::clone(&file), LogLevel::AllDataInPdu);
    let mut session = session_for(&HOST_CHALLENGE, Algorithm::Rsa);
    ctx.deriver()
        .derive(&mut session, Some(HOST_CHALLENGE))
        .await
        .unwrap();
    file.flush().unwrap();

    let log = std::fs::read_to_string(&path).unwrap();
    assert!(log.contains(&format!("host_challenge={}", hex::encode_upper(HOST_CHALLENGE))));
    assert!(log.contains("DEBUG 8 ConnectionPool::acquire: Connection acquired"));
}
