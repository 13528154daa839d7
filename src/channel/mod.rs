//! Secure channel between the RA and a token
//!
//! Session keys are diversified from a master key (locally or by the TKS),
//! and both sides prove knowledge of them through cryptograms over the card
//! and host challenges.

pub mod algorithm;
pub mod crypto;

pub use algorithm::{is_algorithm_ecc, Algorithm};
pub use crypto::{
    compute_card_cryptogram, compute_host_cryptogram, derive_local_session_keys, Challenge,
    ChannelParams, Cryptogram, KeySource, SecureChannelCrypto, SessionKeyBundle, CHALLENGE_LEN,
    CRYPTOGRAM_LEN,
};
