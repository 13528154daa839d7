//! Session key derivation
//!
//! Runs the mutual-authentication handshake for one Session. With a local
//! master key the keys are diversified in-process; otherwise the challenge
//! set goes to a TKS connection from the pool. Connection faults fail over
//! within the pool; cryptogram mismatches and malformed responses end the
//! Session immediately.

use std::sync::Arc;

use super::{Session, SessionState};
use crate::backend::{BackendKind, BackendTransport};
use crate::channel::{Challenge, KeySource, SecureChannelCrypto, SessionKeyBundle};
use crate::diagnostics::{Diagnostics, LogLevel};
use crate::pool::BackendPools;
use crate::types::{RaError, Result};

/// Connection identity recorded for in-process derivations
pub const LOCAL_CONNECTION_ID: &str = "local";

/// Fails a Session left in `AwaitingBackend` when `derive` is dropped mid-call.
struct PendingDerivation<'a> {
    session: &'a mut Session,
}

impl Drop for PendingDerivation<'_> {
    fn drop(&mut self) {
        if self.session.state() == SessionState::AwaitingBackend {
            self.session.fail(&RaError::InvalidSessionState(
                "Derivation abandoned before the backend answered".into(),
            ));
        }
    }
}

/// Drives Sessions from `Idle`/`ChallengeIssued` to `Derived` or `Failed`.
#[derive(Clone)]
pub struct SessionKeyDeriver {
    crypto: SecureChannelCrypto,
    pools: BackendPools,
    diagnostics: Diagnostics,
}

impl SessionKeyDeriver {
    pub fn new(crypto: SecureChannelCrypto, pools: BackendPools, diagnostics: Diagnostics) -> Self {
        Self {
            crypto,
            pools,
            diagnostics,
        }
    }

    /// Derive the session keys for `session`.
    ///
    /// An `Idle` session gets `host_challenge` (or a random one) issued
    /// first. On success the session is `Derived` and holds its keys; on any
    /// error it is `Failed` and holds none. Sessions already in a terminal
    /// state are rejected untouched.
    pub async fn derive(&self, session: &mut Session, host_challenge: Option<Challenge>) -> Result<()> {
        match session.state() {
            SessionState::Idle => {
                session.issue_host_challenge(host_challenge)?;
            }
            SessionState::ChallengeIssued => {}
            state => {
                return Err(RaError::InvalidSessionState(format!(
                    "Session {} is {}; derive a new session instead",
                    session.id(),
                    state
                )));
            }
        }
        session.begin_backend()?;
        let mut guard = PendingDerivation { session };
        let session = &*guard.session;

        let session_id = session.id();
        self.diagnostics.debug(
            LogLevel::PerConnection,
            "SessionKeyDeriver::derive",
            "Deriving session keys",
            &[
                ("session", &session_id),
                ("cuid", &hex::encode_upper(session.cuid())),
                ("algorithm", &session.algorithm()),
            ],
        );
        if let Some(hc) = session.host_challenge() {
            self.diagnostics.debug_buffer(
                LogLevel::AllDataInPdu,
                "SessionKeyDeriver::derive",
                "host_challenge=",
                hc,
            );
        }

        let outcome = self.run(session).await;
        let session = &mut *guard.session;
        match outcome {
            Ok((keys, connection)) => {
                self.diagnostics.debug(
                    LogLevel::PerConnection,
                    "SessionKeyDeriver::derive",
                    "Session keys derived",
                    &[
                        ("session", &session_id),
                        ("connection", &connection),
                        ("kcv", &hex::encode_upper(keys.key_check_value)),
                    ],
                );
                session.complete(keys, connection)
            }
            Err(e) => {
                self.diagnostics.error(
                    LogLevel::PerConnection,
                    "SessionKeyDeriver::derive",
                    "Session key derivation failed",
                    &[("session", &session_id), ("error", &e), ("kind", &e.kind())],
                );
                session.fail(&e);
                Err(e)
            }
        }
    }

    async fn run(&self, session: &Session) -> Result<(SessionKeyBundle, String)> {
        let params = session.channel_params()?;

        if let Some(master) = self.crypto.key_store().master_key() {
            let keys = self
                .crypto
                .compute_session_key(&params, KeySource::Local(master))
                .await?;
            return Ok((keys, LOCAL_CONNECTION_ID.to_string()));
        }

        let crypto = &self.crypto;
        let params = &params;
        let served = self
            .pools
            .pool(BackendKind::Tks)
            .call_with_failover(|conn: Arc<dyn BackendTransport>| async move {
                crypto
                    .compute_session_key(params, KeySource::Tks(conn.as_ref()))
                    .await
            })
            .await?;

        if served.failovers() > 0 {
            self.diagnostics.debug(
                LogLevel::PerConnection,
                "SessionKeyDeriver::run",
                "Derivation served after failover",
                &[("endpoint", &served.endpoint), ("attempts", &served.attempts)],
            );
        }
        Ok((served.value, served.endpoint))
    }
}
