//! Configuration module for pwebm
//!
//! Handles loading configuration from TOML files, environment variable
//! overrides and the well-known paths the tool uses.

pub mod config;
pub mod paths;

pub use config::*;
pub use paths::*;
