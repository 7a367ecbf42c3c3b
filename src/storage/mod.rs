//! Content-addressable byte stores.

pub mod local;
pub mod lock;

use std::fmt;
use std::io::{BufRead, Write};

use crate::error::{CacheError, CacheResult};

pub use local::{Compression, LocalStorage};
pub use lock::FileLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Binary,
    Text,
}

/// How a formatter needs its handle opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub access: Access,
    pub encoding: Encoding,
}

impl OpenMode {
    pub const READ_BINARY: Self = Self::new(Access::Read, Encoding::Binary);
    pub const READ_TEXT: Self = Self::new(Access::Read, Encoding::Text);
    pub const WRITE_BINARY: Self = Self::new(Access::Write, Encoding::Binary);
    pub const WRITE_TEXT: Self = Self::new(Access::Write, Encoding::Text);

    pub const fn new(access: Access, encoding: Encoding) -> Self {
        Self { access, encoding }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let access = match self.access {
            Access::Read => 'r',
            Access::Write => 'w',
        };
        let encoding = match self.encoding {
            Encoding::Binary => 'b',
            Encoding::Text => 't',
        };
        write!(f, "{access}{encoding}")
    }
}

/// Write side of a handle. Bytes only become visible under the key once
/// [`ArtifactWriter::commit`] succeeds; dropping an uncommitted writer
/// discards everything written through it.
pub trait ArtifactWriter: Write + Send {
    fn commit(self: Box<Self>) -> CacheResult<()>;
}

/// A handle scoped to one open of one key.
pub enum Handle {
    Reader(Box<dyn BufRead + Send>),
    Writer(Box<dyn ArtifactWriter>),
}

impl Handle {
    pub fn into_reader(self, key: &str) -> CacheResult<Box<dyn BufRead + Send>> {
        match self {
            Self::Reader(reader) => Ok(reader),
            Self::Writer(_) => Err(CacheError::HandleMode {
                key: key.to_string(),
                expected: "reading",
            }),
        }
    }

    pub fn into_writer(self, key: &str) -> CacheResult<Box<dyn ArtifactWriter>> {
        match self {
            Self::Writer(writer) => Ok(writer),
            Self::Reader(_) => Err(CacheError::HandleMode {
                key: key.to_string(),
                expected: "writing",
            }),
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reader(_) => f.write_str("Handle::Reader"),
            Self::Writer(_) => f.write_str("Handle::Writer"),
        }
    }
}

pub trait Storage: fmt::Debug + Send + Sync {
    /// Opens `key`. Write handles hold the key's lock until they are
    /// committed or dropped.
    fn open(&self, key: &str, mode: OpenMode) -> CacheResult<Handle>;

    fn exists(&self, key: &str) -> bool;

    /// Fails with [`CacheError::NotFound`] when nothing is stored under `key`.
    fn remove(&self, key: &str) -> CacheResult<()>;

    fn all(&self) -> CacheResult<Vec<String>>;

    fn filter(&self, prefix: &str) -> CacheResult<Vec<String>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect())
    }
}

/// Keys become file names, so they must stay inside the store root.
pub fn validate_key(key: &str) -> CacheResult<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && !key.ends_with(".lock")
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidKey {
            key: key.to_string(),
        })
    }
}
