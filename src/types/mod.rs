//! Shared types

pub mod error;

pub use error::{RaError, Result};
