//! Secure channel cryptography.
//!
//! # Algorithms
//!
//! - **Diversification**: HKDF-SHA256, master key -> per-card static keys ->
//!   per-session keys bound to both challenges
//! - **Cryptograms**: HMAC-SHA256 under the encryption session key, truncated
//!   to 8 bytes. Host cryptogram covers `card || host`, card cryptogram
//!   covers `host || card`.
//! - **Transport**: session keys returned by the TKS are wrapped under the
//!   shared transport key (`sharedSecret`)
//!
//! Everything here is a function of its inputs. The only shared state is the
//! verification lock, held just for the card-cryptogram comparison.

use std::sync::{Arc, Mutex, PoisonError};

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::backend::{fields, BackendKind, BackendOp, BackendRequest, BackendTransport};
use crate::keys::{
    key_check_value, unwrap_sym_key, wrap_sym_key, KeyStore, SymKey, DRM_TRANSPORT_KEY_NAME,
    KCV_LEN, SYM_KEY_LEN,
};
use crate::types::{RaError, Result};

/// Card and host challenge length (8 bytes)
pub const CHALLENGE_LEN: usize = 8;

/// Host and card cryptogram length (8 bytes)
pub const CRYPTOGRAM_LEN: usize = 8;

pub type Challenge = [u8; CHALLENGE_LEN];
pub type Cryptogram = [u8; CRYPTOGRAM_LEN];

const CARD_KEY_LABEL: &[u8] = b"token-ra card ";
const SESSION_KEY_LABEL: &[u8] = b"token-ra session ";

/// Which session key is being derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    Enc,
    Mac,
    Kek,
}

impl KeyPurpose {
    fn label(self) -> &'static [u8] {
        match self {
            Self::Enc => b"enc",
            Self::Mac => b"mac",
            Self::Kek => b"kek",
        }
    }
}

/// Inputs to one session-key computation.
#[derive(Debug, Clone, Copy)]
pub struct ChannelParams<'a> {
    pub cuid: &'a [u8],
    pub key_info: &'a [u8],
    pub card_challenge: &'a [u8],
    pub host_challenge: &'a [u8],
    pub card_cryptogram: &'a [u8],
    pub key_set: &'a str,
}

impl ChannelParams<'_> {
    /// Reject malformed inputs before any key material is touched.
    pub fn validate(&self) -> Result<()> {
        if self.cuid.is_empty() {
            return Err(RaError::CryptoFailure("CUID is empty".into()));
        }
        if self.key_info.is_empty() {
            return Err(RaError::CryptoFailure("Key diversification info is empty".into()));
        }
        check_len("card challenge", self.card_challenge, CHALLENGE_LEN)?;
        check_len("host challenge", self.host_challenge, CHALLENGE_LEN)?;
        check_len("card cryptogram", self.card_cryptogram, CRYPTOGRAM_LEN)?;
        Ok(())
    }
}

fn check_len(what: &str, bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() != expected {
        return Err(RaError::CryptoFailure(format!(
            "Invalid {} length: expected {}, got {}",
            what,
            expected,
            bytes.len()
        )));
    }
    Ok(())
}

/// Everything one successful derivation produces.
#[derive(Debug, Clone)]
pub struct SessionKeyBundle {
    /// MAC session key (`sessionKey` on the wire)
    pub mac_key: SymKey,
    /// Encryption session key
    pub enc_key: SymKey,
    /// Key-encryption key for private key transport
    pub kek: SymKey,
    pub key_check_value: [u8; KCV_LEN],
    pub host_cryptogram: Cryptogram,
    /// KEK wrapped under the DRM transport key, opaque to this engine
    pub drm_wrapped_kek: Option<Vec<u8>>,
}

/// Where session keys come from.
#[derive(Clone, Copy)]
pub enum KeySource<'a> {
    /// Master key held locally: diversify in-process
    Local(&'a SymKey),
    /// Delegate to a TKS connection
    Tks(&'a dyn BackendTransport),
}

fn hkdf_expand(ikm: &[u8], salt: &[u8], label: &[u8], context: &[u8]) -> Result<SymKey> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut info = Vec::with_capacity(label.len() + context.len());
    info.extend_from_slice(label);
    info.extend_from_slice(context);
    let mut okm = [0u8; SYM_KEY_LEN];
    hk.expand(&info, &mut okm)
        .map_err(|e| RaError::CryptoFailure(format!("HKDF expand failed: {e}")))?;
    Ok(SymKey::from_bytes(okm))
}

/// Per-card static key for `purpose`.
pub fn diversify_card_key(
    master: &SymKey,
    cuid: &[u8],
    key_info: &[u8],
    purpose: KeyPurpose,
) -> Result<SymKey> {
    let mut context = purpose.label().to_vec();
    context.extend_from_slice(cuid);
    hkdf_expand(master.as_bytes(), key_info, CARD_KEY_LABEL, &context)
}

/// Session key for `purpose` from a card static key and both challenges.
pub fn derive_session_key(
    card_key: &SymKey,
    card_challenge: &[u8],
    host_challenge: &[u8],
    purpose: KeyPurpose,
) -> Result<SymKey> {
    let mut salt = Vec::with_capacity(card_challenge.len() + host_challenge.len());
    salt.extend_from_slice(card_challenge);
    salt.extend_from_slice(host_challenge);
    hkdf_expand(card_key.as_bytes(), &salt, SESSION_KEY_LABEL, purpose.label())
}

/// Full local diversification: returns `(mac, enc, kek)` session keys.
pub fn derive_local_session_keys(
    master: &SymKey,
    params: &ChannelParams<'_>,
) -> Result<(SymKey, SymKey, SymKey)> {
    let derive = |purpose: KeyPurpose| -> Result<SymKey> {
        let card_key = diversify_card_key(master, params.cuid, params.key_info, purpose)?;
        derive_session_key(&card_key, params.card_challenge, params.host_challenge, purpose)
    };
    Ok((
        derive(KeyPurpose::Mac)?,
        derive(KeyPurpose::Enc)?,
        derive(KeyPurpose::Kek)?,
    ))
}

fn cryptogram(key: &SymKey, first: &[u8], second: &[u8]) -> Result<Cryptogram> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key.as_bytes())
        .map_err(|e| RaError::CryptoFailure(format!("HMAC init failed: {e}")))?;
    mac.update(first);
    mac.update(second);
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; CRYPTOGRAM_LEN];
    out.copy_from_slice(&tag[..CRYPTOGRAM_LEN]);
    Ok(out)
}

/// Cryptogram the card checks to authenticate the host.
pub fn compute_host_cryptogram(
    enc_key: &SymKey,
    card_challenge: &[u8],
    host_challenge: &[u8],
) -> Result<Cryptogram> {
    check_len("card challenge", card_challenge, CHALLENGE_LEN)?;
    check_len("host challenge", host_challenge, CHALLENGE_LEN)?;
    cryptogram(enc_key, card_challenge, host_challenge)
}

/// Cryptogram the card produces to authenticate itself.
pub fn compute_card_cryptogram(
    enc_key: &SymKey,
    card_challenge: &[u8],
    host_challenge: &[u8],
) -> Result<Cryptogram> {
    check_len("card challenge", card_challenge, CHALLENGE_LEN)?;
    check_len("host challenge", host_challenge, CHALLENGE_LEN)?;
    cryptogram(enc_key, host_challenge, card_challenge)
}

/// Session-key computation and verification for secure channels.
#[derive(Clone)]
pub struct SecureChannelCrypto {
    keys: Arc<KeyStore>,
    verify_lock: Arc<Mutex<()>>,
}

impl SecureChannelCrypto {
    pub fn new(keys: Arc<KeyStore>, verify_lock: Arc<Mutex<()>>) -> Self {
        Self { keys, verify_lock }
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.keys
    }

    /// Derive session keys for one token interaction.
    ///
    /// Local sources diversify in-process; TKS sources send the challenge set
    /// to the backend and validate what comes back. Either way the card's own
    /// cryptogram must match the one recomputed from the derived keys.
    pub async fn compute_session_key(
        &self,
        params: &ChannelParams<'_>,
        source: KeySource<'_>,
    ) -> Result<SessionKeyBundle> {
        params.validate()?;

        let bundle = match source {
            KeySource::Local(master) => self.derive_locally(master, params)?,
            KeySource::Tks(conn) => self.derive_remotely(conn, params).await?,
        };

        self.verify_card_cryptogram(&bundle.enc_key, params)?;
        Ok(bundle)
    }

    fn derive_locally(&self, master: &SymKey, params: &ChannelParams<'_>) -> Result<SessionKeyBundle> {
        let (mac_key, enc_key, kek) = derive_local_session_keys(master, params)?;
        let host_cryptogram =
            compute_host_cryptogram(&enc_key, params.card_challenge, params.host_challenge)?;
        let drm_wrapped_kek = match self.keys.find(DRM_TRANSPORT_KEY_NAME) {
            Some(drm_key) => Some(wrap_sym_key(drm_key, &kek)?),
            None => None,
        };
        Ok(SessionKeyBundle {
            key_check_value: key_check_value(&kek)?,
            mac_key,
            enc_key,
            kek,
            host_cryptogram,
            drm_wrapped_kek,
        })
    }

    async fn derive_remotely(
        &self,
        conn: &dyn BackendTransport,
        params: &ChannelParams<'_>,
    ) -> Result<SessionKeyBundle> {
        let transport_key = self.keys.transport_key()?;

        let request = BackendRequest::new(BackendOp::ComputeSessionKey)
            .hex_param(fields::CUID, params.cuid)
            .hex_param(fields::KDD, params.key_info)
            .hex_param(fields::CARD_CHALLENGE, params.card_challenge)
            .hex_param(fields::HOST_CHALLENGE, params.host_challenge)
            .hex_param(fields::CARD_CRYPTOGRAM, params.card_cryptogram)
            .param(fields::KEY_SET, params.key_set);

        let response = conn.send(request).await?;
        response.ensure_ok(BackendKind::Tks)?;

        // Keys that fail to unwrap under the shared secret mean the response
        // wasn't produced for us, so treat it as a protocol fault.
        let unwrap_field = |name: &str| -> Result<SymKey> {
            let wire = response.require_hex(name)?;
            unwrap_sym_key(transport_key, &wire).map_err(|e| {
                RaError::ProtocolViolation(format!("TKS field '{}' did not unwrap: {}", name, e))
            })
        };
        let mac_key = unwrap_field(fields::SESSION_KEY)?;
        let enc_key = unwrap_field(fields::ENC_SESSION_KEY)?;
        let kek = unwrap_field(fields::KEK_DES_KEY)?;

        let returned_host = response.require_hex(fields::HOST_CRYPTOGRAM)?;
        let expected_host =
            compute_host_cryptogram(&enc_key, params.card_challenge, params.host_challenge)?;
        if !bool::from(returned_host.as_slice().ct_eq(&expected_host)) {
            return Err(RaError::ProtocolViolation(
                "TKS host cryptogram does not match derived session key".into(),
            ));
        }

        let kcv = key_check_value(&kek)?;
        if let Some(reported) = response.get(fields::KEY_CHECK) {
            if !bool::from(hex::decode(reported)?.as_slice().ct_eq(&kcv)) {
                return Err(RaError::ProtocolViolation(
                    "TKS key check value does not match KEK".into(),
                ));
            }
        }

        let drm_wrapped_kek = match response.get(fields::DRM_TRANS_DES_KEY) {
            Some(v) if !v.is_empty() => Some(hex::decode(v)?),
            _ => None,
        };

        Ok(SessionKeyBundle {
            mac_key,
            enc_key,
            kek,
            key_check_value: kcv,
            host_cryptogram: expected_host,
            drm_wrapped_kek,
        })
    }

    /// Compare the card's cryptogram against the recomputed one.
    ///
    /// The provider behind this is not assumed reentrant, so comparisons are
    /// serialized on the verify lock.
    fn verify_card_cryptogram(&self, enc_key: &SymKey, params: &ChannelParams<'_>) -> Result<()> {
        let _guard = self
            .verify_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let expected =
            compute_card_cryptogram(enc_key, params.card_challenge, params.host_challenge)?;
        if bool::from(params.card_cryptogram.ct_eq(&expected)) {
            Ok(())
        } else {
            Err(RaError::ProtocolViolation("Card cryptogram mismatch".into()))
        }
    }
}
