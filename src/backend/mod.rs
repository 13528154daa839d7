//! Backend connection abstraction.
//!
//! This module defines the `BackendTransport` trait - the seam between the
//! engine and the TKS, CA and DRM services. Requests and responses are flat
//! records of named fields, form-encoded on the wire.

pub mod http;
pub mod mock;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{RaError, Result};

pub use http::HttpTransport;

/// Which backend service a connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Tks,
    Ca,
    Drm,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Tks, BackendKind::Ca, BackendKind::Drm];
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tks => "TKS",
            Self::Ca => "CA",
            Self::Drm => "DRM",
        })
    }
}

/// Backend operations the engine issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOp {
    ComputeSessionKey,
    ArchiveKey,
    RecoverKey,
}

impl BackendOp {
    /// Servlet path appended to the endpoint URL
    pub fn path(&self) -> &'static str {
        match self {
            Self::ComputeSessionKey => "tks/agent/tks/computeSessionKey",
            Self::ArchiveKey => "kra/agent/kra/GenerateKeyPair",
            Self::RecoverKey => "kra/agent/kra/TokenKeyRecovery",
        }
    }
}

/// Response status meaning success
pub const STATUS_OK: &str = "0";

/// DRM status meaning "no archived key for this certificate"
pub const STATUS_NO_SUCH_KEY: &str = "2";

/// Response field names
pub mod fields {
    pub const STATUS: &str = "status";
    pub const ERROR: &str = "error";

    pub const SESSION_KEY: &str = "sessionKey";
    pub const ENC_SESSION_KEY: &str = "encSessionKey";
    pub const KEK_DES_KEY: &str = "kek_wrapped_desKey";
    pub const DRM_TRANS_DES_KEY: &str = "drm_trans_wrapped_desKey";
    pub const HOST_CRYPTOGRAM: &str = "hostCryptogram";
    pub const KEY_CHECK: &str = "keycheck";

    pub const CUID: &str = "CUID";
    pub const KDD: &str = "KDD";
    pub const CARD_CHALLENGE: &str = "card_challenge";
    pub const HOST_CHALLENGE: &str = "host_challenge";
    pub const CARD_CRYPTOGRAM: &str = "card_cryptogram";
    pub const KEY_SET: &str = "keySet";

    pub const USER_ID: &str = "userid";
    pub const DRM_TRANS_KEY: &str = "drm_trans_desKey";
    pub const WRAPPED_PRIVATE_KEY: &str = "wrapped_private_key";
    pub const WRAPPED_PRIV_KEY: &str = "wrapped_priv_key";
    pub const IV_PARAM: &str = "iv_param";
    pub const PUBLIC_KEY: &str = "public_key";
    pub const KEY_TYPE: &str = "key_type";
    pub const KEY_SIZE: &str = "key_size";
    pub const KEY_ID: &str = "key_id";
    pub const CERT: &str = "cert";
}

/// A request to a backend: an operation plus named parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRequest {
    pub op: BackendOp,
    pub params: BTreeMap<String, String>,
}

impl BackendRequest {
    pub fn new(op: BackendOp) -> Self {
        Self {
            op,
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn hex_param(self, name: &str, bytes: &[u8]) -> Self {
        self.param(name, hex::encode_upper(bytes))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Form-encoded body
    pub fn encode(&self) -> String {
        // BTreeMap<String, String> always serializes
        serde_urlencoded::to_string(&self.params).unwrap_or_default()
    }
}

/// A structured backend response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendResponse {
    pub fields: BTreeMap<String, String>,
}

impl BackendResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok() -> Self {
        Self::new().with(fields::STATUS, STATUS_OK)
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn with_hex(self, name: &str, bytes: &[u8]) -> Self {
        self.with(name, hex::encode_upper(bytes))
    }

    /// Parse a form-encoded body.
    pub fn decode(body: &str) -> Result<Self> {
        let fields: BTreeMap<String, String> = serde_urlencoded::from_str(body.trim())?;
        Ok(Self { fields })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn status(&self) -> Option<&str> {
        self.get(fields::STATUS)
    }

    /// A field that must be present; absence is a malformed response.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| RaError::ProtocolViolation(format!("Response missing field '{}'", name)))
    }

    pub fn require_hex(&self, name: &str) -> Result<Vec<u8>> {
        Ok(hex::decode(self.require(name)?)?)
    }

    /// Fail with `ProtocolViolation` unless the backend reported success.
    pub fn ensure_ok(&self, kind: BackendKind) -> Result<()> {
        match self.status() {
            Some(STATUS_OK) => Ok(()),
            Some(status) => Err(RaError::ProtocolViolation(format!(
                "{} reported status {}{}",
                kind,
                status,
                self.get(fields::ERROR)
                    .map(|e| format!(": {e}"))
                    .unwrap_or_default()
            ))),
            None => Err(RaError::ProtocolViolation(format!(
                "{} response has no status",
                kind
            ))),
        }
    }
}

/// Core trait for backend connections.
///
/// Implementations report link-level trouble (refused, reset, timed out) as
/// `RaError::ConnectionFailure`; anything else is taken as final.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    /// Stable identity of the endpoint (URL or test label)
    fn endpoint(&self) -> &str;

    /// Send one request and wait for the structured response.
    async fn send(&self, request: BackendRequest) -> Result<BackendResponse>;
}
