//! Zero Common - Shared types, utilities, and configuration for the Zero ecosystem.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Error types and handling utilities
//! - Logging setup

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    AssetEntry, Config, FundamentalsConfig, FundamentalsStorageConfig, ObservabilityConfig,
    RateLimitConfig, SourceEntry,
};
pub use error::{Error, Result};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::{Config, FundamentalsConfig};
    pub use crate::error::{Error, Result};
    pub use crate::logging::{init_logging, init_logging_with_exclusions};
}
