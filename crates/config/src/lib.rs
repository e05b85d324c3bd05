//! Configuration for av1conv
//!
//! Handles loading configuration from TOML files, environment variable overrides
//! and range validation of every encoder tunable.

pub mod config;

pub use config::*;
