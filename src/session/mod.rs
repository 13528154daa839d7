//! Token sessions
//!
//! A `Session` is one token interaction. It moves through
//! `Idle -> ChallengeIssued -> AwaitingBackend -> {Derived | Failed}` and
//! holds session keys only once a derivation has fully succeeded. The
//! terminal states never go back; retrying after a failure means a new
//! Session.

pub mod deriver;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use uuid::Uuid;

use crate::channel::{
    Algorithm, Challenge, ChannelParams, Cryptogram, SessionKeyBundle, CHALLENGE_LEN,
    CRYPTOGRAM_LEN,
};
use crate::keys::generate_random_bytes;
use crate::types::{RaError, Result};

pub use deriver::{SessionKeyDeriver, LOCAL_CONNECTION_ID};

/// Key set requested from the TKS when the caller names none
pub const DEFAULT_KEY_SET: &str = "defKeySet";

/// Where a Session is in the derivation handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    ChallengeIssued,
    AwaitingBackend,
    Derived,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Derived | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::ChallengeIssued => "challenge_issued",
            Self::AwaitingBackend => "awaiting_backend",
            Self::Derived => "derived",
            Self::Failed => "failed",
        })
    }
}

/// One token interaction.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    cuid: Vec<u8>,
    key_info: Vec<u8>,
    card_challenge: Challenge,
    card_cryptogram: Cryptogram,
    algorithm: Algorithm,
    key_set: String,
    host_challenge: Option<Challenge>,
    state: SessionState,
    keys: Option<SessionKeyBundle>,
    /// Endpoint that served the derivation ("local" for in-process)
    connection: Option<String>,
    failure: Option<String>,
    created_at: u64,
}

impl Session {
    /// Open a session from what the card sent in its initialize-update reply.
    pub fn new(
        cuid: &[u8],
        key_info: &[u8],
        card_challenge: &[u8],
        card_cryptogram: &[u8],
        algorithm: Algorithm,
    ) -> Result<Self> {
        if cuid.is_empty() {
            return Err(RaError::CryptoFailure("CUID is empty".into()));
        }
        if key_info.is_empty() {
            return Err(RaError::CryptoFailure("Key diversification info is empty".into()));
        }
        let card_challenge: Challenge = card_challenge.try_into().map_err(|_| {
            RaError::CryptoFailure(format!(
                "Card challenge must be {} bytes, got {}",
                CHALLENGE_LEN,
                card_challenge.len()
            ))
        })?;
        let card_cryptogram: Cryptogram = card_cryptogram.try_into().map_err(|_| {
            RaError::CryptoFailure(format!(
                "Card cryptogram must be {} bytes, got {}",
                CRYPTOGRAM_LEN,
                card_cryptogram.len()
            ))
        })?;

        Ok(Self {
            id: Uuid::new_v4(),
            cuid: cuid.to_vec(),
            key_info: key_info.to_vec(),
            card_challenge,
            card_cryptogram,
            algorithm,
            key_set: DEFAULT_KEY_SET.to_string(),
            host_challenge: None,
            state: SessionState::Idle,
            keys: None,
            connection: None,
            failure: None,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        })
    }

    pub fn with_key_set(mut self, key_set: impl Into<String>) -> Self {
        self.key_set = key_set.into();
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cuid(&self) -> &[u8] {
        &self.cuid
    }

    pub fn key_info(&self) -> &[u8] {
        &self.key_info
    }

    pub fn card_challenge(&self) -> &Challenge {
        &self.card_challenge
    }

    pub fn card_cryptogram(&self) -> &Cryptogram {
        &self.card_cryptogram
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn key_set(&self) -> &str {
        &self.key_set
    }

    pub fn host_challenge(&self) -> Option<&Challenge> {
        self.host_challenge.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_derived(&self) -> bool {
        self.state == SessionState::Derived
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Endpoint identity of the connection that derived the keys
    pub fn connection_id(&self) -> Option<&str> {
        self.connection.as_deref()
    }

    /// Why the session failed, if it did
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Derived keys; an error until the session reaches `Derived`.
    pub fn keys(&self) -> Result<&SessionKeyBundle> {
        match (&self.state, &self.keys) {
            (SessionState::Derived, Some(keys)) => Ok(keys),
            _ => Err(RaError::InvalidSessionState(format!(
                "Session {} is {}, keys not ready",
                self.id, self.state
            ))),
        }
    }

    /// Host cryptogram to send to the card, once derived
    pub fn host_cryptogram(&self) -> Option<&Cryptogram> {
        self.keys().ok().map(|k| &k.host_cryptogram)
    }

    /// Issue the host challenge: the supplied one, or a fresh random one.
    pub fn issue_host_challenge(&mut self, challenge: Option<Challenge>) -> Result<Challenge> {
        if self.state != SessionState::Idle {
            return Err(RaError::InvalidSessionState(format!(
                "Host challenge already issued (session {} is {})",
                self.id, self.state
            )));
        }
        let challenge = challenge.unwrap_or_else(generate_random_bytes::<CHALLENGE_LEN>);
        self.host_challenge = Some(challenge);
        self.state = SessionState::ChallengeIssued;
        Ok(challenge)
    }

    pub(crate) fn begin_backend(&mut self) -> Result<()> {
        if self.state != SessionState::ChallengeIssued {
            return Err(RaError::InvalidSessionState(format!(
                "Cannot start derivation: session {} is {}",
                self.id, self.state
            )));
        }
        self.state = SessionState::AwaitingBackend;
        Ok(())
    }

    /// Inputs for the session-key computation.
    pub fn channel_params(&self) -> Result<ChannelParams<'_>> {
        let host_challenge = self.host_challenge.as_ref().ok_or_else(|| {
            RaError::InvalidSessionState(format!("Session {} has no host challenge", self.id))
        })?;
        Ok(ChannelParams {
            cuid: &self.cuid,
            key_info: &self.key_info,
            card_challenge: &self.card_challenge,
            host_challenge,
            card_cryptogram: &self.card_cryptogram,
            key_set: &self.key_set,
        })
    }

    /// Store keys from the one successful run. Write-once.
    pub(crate) fn complete(&mut self, keys: SessionKeyBundle, connection: String) -> Result<()> {
        if self.state != SessionState::AwaitingBackend || self.keys.is_some() {
            return Err(RaError::InvalidSessionState(format!(
                "Session {} is {}, refusing to store keys",
                self.id, self.state
            )));
        }
        self.keys = Some(keys);
        self.connection = Some(connection);
        self.state = SessionState::Derived;
        Ok(())
    }

    pub(crate) fn fail(&mut self, error: &RaError) {
        self.keys = None;
        self.failure = Some(error.to_string());
        self.state = SessionState::Failed;
    }
}
