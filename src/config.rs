//! File and environment configuration.
//!
//! Settings resolve per computation, then per cache, then globally. At every
//! level a value given in code wins over the configuration file.
//!
//! ```toml
//! [caches.default]
//! root = ".cachestore"
//! compression = "gzip"
//! formatter = "msgpack"
//!
//! [caches.default.functions."pipeline.load"]
//! ignore = ["verbose"]
//! expire = 7
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::cache::Expire;
use crate::cache::path::cache_root;
use crate::error::{CacheError, CacheResult};
use crate::storage::{Compression, LocalStorage};

pub const CONFIG_FILE_NAME: &str = "cachestore.toml";
pub const CONFIG_PATH_ENV: &str = "CACHESTORE_CONFIG_PATH";
pub const DISABLE_ENV: &str = "CACHESTORE_DISABLE";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub caches: BTreeMap<String, CacheSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    pub root: Option<PathBuf>,
    pub compression: Option<String>,
    pub formatter: Option<String>,
    pub hasher: Option<String>,
    pub disable: Option<bool>,
    /// Keyed by qualified function name.
    pub functions: BTreeMap<String, FunctionSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FunctionSection {
    pub ignore: Option<Vec<String>>,
    pub expire: Option<ExpireSetting>,
    pub disable: Option<bool>,
}

/// `expire = 7` or `expire = "2026-01-31"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ExpireSetting {
    Days(i64),
    Text(String),
}

impl ExpireSetting {
    pub fn to_expire(&self) -> CacheResult<Expire> {
        match self {
            Self::Days(days) => Ok(Expire::Days(*days)),
            Self::Text(text) => text.parse(),
        }
    }
}

impl Config {
    /// Reads `cachestore.toml` from the working directory, then the file
    /// named by `CACHESTORE_CONFIG_PATH`, then `explicit`. Later files
    /// override earlier ones key by key. Only `explicit` has to exist.
    pub fn load(explicit: Option<&Path>) -> CacheResult<Self> {
        let mut config = Self::default();

        let mut discovered = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(path) = env::var_os(CONFIG_PATH_ENV).filter(|path| !path.is_empty()) {
            discovered.push(PathBuf::from(path));
        }
        for path in discovered.iter().filter(|path| path.is_file()) {
            if cfg!(feature = "toml-config") {
                config.merge(Self::from_file(path)?);
            } else {
                debug!(path = %path.display(), "configuration support disabled; ignoring file");
            }
        }

        if let Some(path) = explicit {
            config.merge(Self::from_file(path)?);
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> CacheResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| CacheError::io(path, err))?;
        debug!(path = %path.display(), "configuration loaded");
        Self::parse(&text).map_err(|err| CacheError::config(format!("{}: {err}", path.display())))
    }

    #[cfg(feature = "toml-config")]
    pub fn parse(text: &str) -> CacheResult<Self> {
        toml::from_str(text).map_err(|err| CacheError::config(err.to_string()))
    }

    #[cfg(not(feature = "toml-config"))]
    pub fn parse(_text: &str) -> CacheResult<Self> {
        Err(CacheError::config(
            "reading configuration files needs the `toml-config` feature",
        ))
    }

    pub fn merge(&mut self, other: Self) {
        for (name, section) in other.caches {
            self.caches.entry(name).or_default().merge(section);
        }
    }

    pub fn cache(&self, name: &str) -> Option<&CacheSection> {
        self.caches.get(name)
    }
}

impl CacheSection {
    fn merge(&mut self, other: Self) {
        overlay(&mut self.root, other.root);
        overlay(&mut self.compression, other.compression);
        overlay(&mut self.formatter, other.formatter);
        overlay(&mut self.hasher, other.hasher);
        overlay(&mut self.disable, other.disable);
        for (name, function) in other.functions {
            self.functions.entry(name).or_default().merge(function);
        }
    }

    pub fn function(&self, qualified_name: &str) -> Option<&FunctionSection> {
        self.functions.get(qualified_name)
    }

    pub fn compression(&self) -> CacheResult<Compression> {
        self.compression
            .as_deref()
            .map_or(Ok(Compression::None), str::parse)
    }

    /// Local storage rooted at the configured directory, or at the default
    /// root.
    pub fn local_storage(&self) -> CacheResult<LocalStorage> {
        let root = self.root.clone().unwrap_or_else(cache_root);
        Ok(LocalStorage::new(root).with_compression(self.compression()?))
    }
}

impl FunctionSection {
    fn merge(&mut self, other: Self) {
        overlay(&mut self.ignore, other.ignore);
        overlay(&mut self.expire, other.expire);
        overlay(&mut self.disable, other.disable);
    }

    pub fn ignore_set(&self) -> Option<BTreeSet<String>> {
        self.ignore.as_ref().map(|names| names.iter().cloned().collect())
    }
}

fn overlay<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

/// Global kill switch: `CACHESTORE_DISABLE=1`.
pub fn env_disabled() -> bool {
    env::var(DISABLE_ENV).is_ok_and(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}
