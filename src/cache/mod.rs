pub mod computation;
pub mod engine;
pub mod expire;
pub mod inventory;
pub mod metadata;
pub mod path;
pub mod registry;

pub use computation::Computation;
pub use engine::{ArtifactIter, ArtifactStream, Cache, CacheBuilder, Cached, WrapOptions};
pub use expire::Expire;
pub use inventory::{FunctionSummary, InventoryEntry, StoreInventory};
pub use metadata::CacheRecord;
pub use registry::{CacheRegistry, FunctionRegistry, RegisteredFunction};
