//! Persistent memoization of function results.
//!
//! A [`Cache`] wraps a [`Computation`] and stores each distinct call's result
//! under a key derived from the function's canonical source and its bound
//! arguments. Renaming locals or reformatting a function keeps its entries;
//! editing its logic does not. Plain values, lazy sequences, futures and
//! asynchronous streams are all supported.
//!
//! ```no_run
//! use cachestore::{Cache, call_args, computation};
//!
//! # fn main() -> cachestore::CacheResult<()> {
//! let cache = Cache::builder("default").build()?;
//! let square = cache.wrap(computation! {
//!     fn square(x: i64) -> i64 {
//!         x * x
//!     }
//! })?;
//! assert_eq!(square.call::<i64>(call_args![12])?, 144);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod formatter;
pub mod hasher;
pub mod identity;
pub mod lexer;
pub mod runtime;
pub mod storage;
pub mod utils;
pub mod version;

pub use cache::{
    ArtifactIter, ArtifactStream, Cache, CacheBuilder, CacheRecord, CacheRegistry, Cached,
    Computation, Expire, WrapOptions,
};
pub use config::Config;
pub use error::{CacheError, CacheResult};
pub use formatter::{Formatter, JsonFormatter, MessagePackFormatter};
pub use hasher::{Hasher, Sha256Hasher};
pub use identity::{
    BoundArguments, CacheKey, CallArgs, ExecutionIdentity, FunctionDef, FunctionIdentity,
    ParamKind, Parameter, Signature,
};
pub use storage::{Compression, LocalStorage, Storage};

/// Error type of computation bodies.
pub type ComputationError = anyhow::Error;
