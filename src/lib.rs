//! token-ra - registration-authority engine for smart-card tokens
//!
//! Authenticates a physical token to the backend key authority, derives
//! per-session keys, and runs server-side key generation and recovery for
//! certificates provisioned onto the token.
//!
//! ## Components
//!
//! - **Channel**: host/card cryptograms and session-key computation
//! - **Pool**: round-robin TKS/CA/DRM connection pools with bounded failover
//! - **Session**: the per-token handshake state machine and its deriver
//! - **Lifecycle**: key generation, DRM escrow and recovery
//! - **Diagnostics**: tiered logging with a buffered, periodically flushed file

pub mod backend;
pub mod channel;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod keys;
pub mod lifecycle;
pub mod pool;
pub mod session;
pub mod types;

pub use config::{Args, ConfigSnapshot};
pub use context::RaContext;
pub use types::{RaError, Result};
