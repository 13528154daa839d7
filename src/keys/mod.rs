//! Key handling for the RA engine
//!
//! - `SymKey`: zeroizing 256-bit symmetric key
//! - `KeyStore`: named long-lived keys (transport keys, optional master key)
//! - `wrap`: authenticated key wrapping and key-check values

pub mod store;
pub mod symkey;
pub mod wrap;

pub use store::{KeyStore, DRM_TRANSPORT_KEY_NAME, MASTER_KEY_NAME, TRANSPORT_KEY_NAME};
pub use symkey::{SymKey, SYM_KEY_LEN};
pub use wrap::{
    generate_random_bytes, key_check_value, unwrap, unwrap_sym_key, wrap, wrap_sym_key,
    WrappedBlob, KCV_LEN, NONCE_LEN,
};
