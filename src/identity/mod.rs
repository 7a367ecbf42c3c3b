//! Key derivation: who a computation is and what one call of it looks like.

pub mod signature;

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::CacheResult;
use crate::hasher::{Hasher, hash_of};
use crate::lexer::canonicalize;

pub use signature::{BoundArguments, CallArgs, ParamKind, Parameter, Signature};

/// Address prefix separating metadata records from artifacts.
pub const METADATA_PREFIX: &str = "metadata-";

/// Static description of a computation.
///
/// The identity derived from a definition is cached on it, so wrapping the
/// same definition again never re-canonicalizes its source.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    symbol: String,
    file: PathBuf,
    source: Option<String>,
    signature: Signature,
    identity: OnceCell<FunctionIdentity>,
}

impl FunctionDef {
    /// `symbol` is the dotted path of the function inside its file.
    pub fn new(symbol: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self {
            symbol: symbol.into(),
            file: file.into(),
            source: None,
            signature: Signature::new(),
            identity: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self.identity = OnceCell::new();
        self
    }

    #[must_use]
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = signature;
        self
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn identity(&self) -> &FunctionIdentity {
        FunctionIdentity::build(self)
    }
}

/// Dotted symbol path for `name` declared in `module_path`, without the
/// crate name: `("app::math", "square")` becomes `math.square`.
pub fn symbol_path(module_path: &str, name: &str) -> String {
    module_path
        .split("::")
        .skip(1)
        .chain(std::iter::once(name))
        .collect::<Vec<_>>()
        .join(".")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionIdentity {
    pub qualified_name: String,
    pub defining_path: String,
    pub canonical_source: String,
}

impl FunctionIdentity {
    /// Identity attached to `def`, derived on first use.
    pub fn build(def: &FunctionDef) -> &Self {
        def.identity.get_or_init(|| Self::derive(def))
    }

    fn derive(def: &FunctionDef) -> Self {
        let qualified_name = match def.file.file_stem() {
            Some(stem) => format!("{}.{}", stem.to_string_lossy(), def.symbol),
            None => def.symbol.clone(),
        };
        let defining_path = std::path::absolute(&def.file)
            .unwrap_or_else(|_| def.file.clone())
            .to_string_lossy()
            .into_owned();

        let canonical_source = match def.source.as_deref() {
            Some(source) => canonicalize(source).unwrap_or_else(|err| {
                warn!(
                    function = %qualified_name,
                    error = %err,
                    "source could not be canonicalized; hashing it verbatim"
                );
                source.to_string()
            }),
            None => {
                warn!(function = %qualified_name, "no source recorded for computation");
                String::new()
            }
        };

        debug!(function = %qualified_name, "function identity derived");
        Self {
            qualified_name,
            defining_path,
            canonical_source,
        }
    }

    pub fn hash(&self, hasher: &dyn Hasher) -> CacheResult<String> {
        hash_of(hasher, self)
    }
}

/// Bound arguments of one call, minus ignored parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionIdentity {
    parameters: Vec<(String, Value)>,
}

impl ExecutionIdentity {
    pub fn build(bound: &BoundArguments, ignore: &BTreeSet<String>) -> Self {
        let parameters = bound
            .iter()
            .filter(|(name, _)| !ignore.contains(*name))
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        Self { parameters }
    }

    pub fn parameters(&self) -> &[(String, Value)] {
        &self.parameters
    }

    pub fn hash(&self, hasher: &dyn Hasher) -> CacheResult<String> {
        hash_of(hasher, self)
    }
}

/// Storage address of one artifact: `<function hash>.<execution hash>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    function_hash: String,
    execution_hash: String,
}

impl CacheKey {
    pub const SEPARATOR: char = '.';

    pub fn new(function_hash: impl Into<String>, execution_hash: impl Into<String>) -> Self {
        Self {
            function_hash: function_hash.into(),
            execution_hash: execution_hash.into(),
        }
    }

    /// Parses an artifact key or a metadata key.
    pub fn parse(key: &str) -> Option<Self> {
        let key = key.strip_prefix(METADATA_PREFIX).unwrap_or(key);
        let (function_hash, execution_hash) = key.split_once(Self::SEPARATOR)?;
        if function_hash.is_empty() || execution_hash.is_empty() {
            return None;
        }
        Some(Self::new(function_hash, execution_hash))
    }

    pub fn function_hash(&self) -> &str {
        &self.function_hash
    }

    pub fn execution_hash(&self) -> &str {
        &self.execution_hash
    }

    pub fn metadata_key(&self) -> String {
        format!("{METADATA_PREFIX}{self}")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.function_hash,
            Self::SEPARATOR,
            self.execution_hash
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_path_drops_the_crate_name() {
        assert_eq!(symbol_path("app::math::ops", "square"), "math.ops.square");
        assert_eq!(symbol_path("app", "square"), "square");
    }

    #[test]
    fn cache_key_round_trips_through_metadata_address() {
        let key = CacheKey::new("abc", "xyz");
        assert_eq!(key.to_string(), "abc.xyz");
        assert_eq!(key.metadata_key(), "metadata-abc.xyz");
        assert_eq!(CacheKey::parse(&key.metadata_key()), Some(key));
        assert_eq!(CacheKey::parse("no-separator"), None);
    }

    #[test]
    fn rewrapping_reuses_the_attached_identity() {
        let def = FunctionDef::new("square", "src/square.rs").with_source("fn square(x: i64) -> i64 { x * x }");
        let first: *const FunctionIdentity = FunctionIdentity::build(&def);
        let second: *const FunctionIdentity = FunctionIdentity::build(&def);
        assert!(std::ptr::eq(first, second));
        assert_eq!(def.identity().qualified_name, "square.square");
    }
}
