//! Configuration helpers for comms services
//!
//! Services read their own typed config structs from the environment;
//! these helpers keep the fail-fast semantics in one place.

use crate::error::{CommsError, Result};
use std::env;

/// Read an env var that must be present for the process to boot.
pub fn required_env(key: &str) -> Result<String> {
    env::var(key).map_err(|_| CommsError::Config(format!("{key} must be set")))
}

/// Read an optional env var with a default.
pub fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read and parse an optional numeric env var with a default.
pub fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
