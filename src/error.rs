use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Every failure the cache surfaces to its callers.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The call could not be reconciled with the computation's signature.
    #[error(
        "invalid arguments for `{function}`: {reason}\n\tsignature : {signature}\n\tgiven args: {given}"
    )]
    InvalidArguments {
        function: String,
        signature: String,
        given: String,
        reason: String,
    },

    /// A signature descriptor that no call could ever bind against.
    #[error("invalid signature: {reason}")]
    InvalidSignature { reason: String },

    /// A computation asked for a bound argument that does not exist.
    #[error("no bound argument named `{name}`")]
    UnknownParameter { name: String },

    /// A bound argument could not be decoded into the requested type.
    #[error("failed to decode argument `{name}`: {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no stored entry for key `{key}`")]
    NotFound { key: String },

    #[error("storage I/O failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("`{key}` is not a valid storage key")]
    InvalidKey { key: String },

    /// A storage handle was used against the mode it was opened with.
    #[error("handle for `{key}` was not opened for {expected}")]
    HandleMode { key: String, expected: &'static str },

    #[error("serialization failed: {reason}")]
    Serialization { reason: String },

    /// The cache instance has no usable name, or its name is already taken.
    #[error("cache identity could not be resolved: {reason}")]
    IdentityUnresolvable { reason: String },

    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// A background producer or blocking worker died before finishing.
    #[error("background worker failed: {reason}")]
    Background { reason: String },

    /// Raised by the wrapped computation itself; passed through untouched.
    #[error(transparent)]
    Computation(anyhow::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// I/O failure on a record stream; the owner of the stream attaches
    /// its location with [`CacheError::located`].
    pub fn stream(source: io::Error) -> Self {
        Self::io(PathBuf::new(), source)
    }

    /// Fills in the location of an I/O error raised without one.
    #[must_use]
    pub fn located(self, path: impl Into<PathBuf>) -> Self {
        match self {
            Self::Io { path: unknown, source } if unknown.as_os_str().is_empty() => Self::io(path, source),
            other => other,
        }
    }

    pub fn serialization(reason: impl ToString) -> Self {
        Self::Serialization {
            reason: reason.to_string(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Wraps an error returned by a computation body. Cache errors raised
    /// inside the body (argument decoding, nested cached calls) keep their
    /// variant.
    pub fn from_computation(err: anyhow::Error) -> Self {
        match err.downcast::<Self>() {
            Ok(err) => err,
            Err(err) => Self::Computation(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
