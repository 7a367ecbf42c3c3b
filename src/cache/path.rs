use std::env;
use std::path::PathBuf;

use crate::identity::{CacheKey, METADATA_PREFIX};

pub const CACHE_DIR_ENV: &str = "CACHESTORE_DIR";
pub const DEFAULT_CACHE_DIR: &str = ".cachestore";

/// Root used when neither code nor configuration names one.
pub fn cache_root() -> PathBuf {
    match env::var_os(CACHE_DIR_ENV) {
        Some(custom) if !custom.is_empty() => PathBuf::from(custom),
        _ => PathBuf::from(DEFAULT_CACHE_DIR),
    }
}

/// Prefix shared by every artifact of one function.
pub fn artifact_prefix(function_hash: &str) -> String {
    format!("{function_hash}{}", CacheKey::SEPARATOR)
}

/// Prefix shared by every metadata record of one function.
pub fn metadata_prefix(function_hash: &str) -> String {
    format!("{METADATA_PREFIX}{}", artifact_prefix(function_hash))
}

pub fn is_metadata_key(key: &str) -> bool {
    key.starts_with(METADATA_PREFIX)
}
