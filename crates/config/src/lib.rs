//! Configuration module for tierstream
//!
//! Handles loading configuration from TOML files and environment variable overrides,
//! and owns the fixed set of quality tier identifiers.

pub mod config;
pub mod tier;

pub use config::*;
pub use tier::{default_tiers, ParseTierIdError, TierConfig, TierId};
