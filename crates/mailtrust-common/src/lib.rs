//! mailtrust Common - Shared types and utilities
//!
//! This crate provides configuration, the error taxonomy, shared types,
//! and secret encryption used across all mailtrust components.

pub mod config;
pub mod error;
pub mod secret;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use secret::SecretCipher;
