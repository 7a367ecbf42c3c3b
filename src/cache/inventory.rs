use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::warn;

use super::metadata::CacheRecord;
use super::path::is_metadata_key;
use crate::error::CacheResult;
use crate::identity::{CacheKey, FunctionIdentity, METADATA_PREFIX};
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub struct InventoryEntry {
    pub key: CacheKey,
    pub record: CacheRecord,
    pub artifact_present: bool,
}

/// Stored entries of one function.
#[derive(Debug, Clone)]
pub struct FunctionSummary {
    pub function: FunctionIdentity,
    pub function_hash: String,
    pub entries: Vec<InventoryEntry>,
}

impl FunctionSummary {
    pub fn last_executed(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().map(|entry| entry.record.executed_at).max()
    }

    pub fn expired(&self, now: DateTime<Utc>) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.record.is_expired_at(now))
            .count()
    }
}

/// Everything found in one store, grouped by function.
///
/// Works from the stored metadata alone, so it needs no computation to be
/// wrapped.
#[derive(Debug, Clone, Default)]
pub struct StoreInventory {
    functions: Vec<FunctionSummary>,
    orphans: Vec<String>,
}

impl StoreInventory {
    pub fn scan(storage: &dyn Storage) -> CacheResult<Self> {
        let mut grouped: BTreeMap<String, FunctionSummary> = BTreeMap::new();
        let mut orphans = Vec::new();

        for metadata_key in storage.filter(METADATA_PREFIX)? {
            let Some(key) = CacheKey::parse(&metadata_key) else {
                orphans.push(metadata_key);
                continue;
            };
            let record = match CacheRecord::read_from(storage, &metadata_key) {
                Ok(record) => record,
                Err(err) if err.is_not_found() => continue,
                Err(err) => {
                    warn!(key = %metadata_key, error = %err, "skipping unreadable cache record");
                    orphans.push(metadata_key);
                    continue;
                }
            };

            let artifact_present = storage.exists(&key.to_string());
            grouped
                .entry(key.function_hash().to_string())
                .or_insert_with(|| FunctionSummary {
                    function: record.function.clone(),
                    function_hash: key.function_hash().to_string(),
                    entries: Vec::new(),
                })
                .entries
                .push(InventoryEntry {
                    key,
                    record,
                    artifact_present,
                });
        }

        for key in storage.all()? {
            if is_metadata_key(&key) {
                continue;
            }
            let described = CacheKey::parse(&key)
                .is_some_and(|parsed| storage.exists(&parsed.metadata_key()));
            if !described {
                orphans.push(key);
            }
        }

        let mut functions: Vec<FunctionSummary> = grouped.into_values().collect();
        for summary in &mut functions {
            summary
                .entries
                .sort_by_key(|entry| entry.record.executed_at);
        }
        functions.sort_by(|a, b| a.function.qualified_name.cmp(&b.function.qualified_name));
        orphans.sort();

        Ok(Self { functions, orphans })
    }

    pub fn functions(&self) -> &[FunctionSummary] {
        &self.functions
    }

    /// Keys that are not part of a complete entry.
    pub fn orphans(&self) -> &[String] {
        &self.orphans
    }

    /// Functions whose qualified name is `name` or ends with `.name`.
    pub fn find(&self, name: &str) -> Vec<&FunctionSummary> {
        let suffix = format!(".{name}");
        self.functions
            .iter()
            .filter(|summary| {
                let qualified = &summary.function.qualified_name;
                qualified == name || qualified.ends_with(&suffix)
            })
            .collect()
    }

    /// Every key that belongs to `summary`, metadata included.
    pub fn keys_of(summary: &FunctionSummary) -> Vec<String> {
        summary
            .entries
            .iter()
            .flat_map(|entry| [entry.key.to_string(), entry.key.metadata_key()])
            .collect()
    }

    /// Keys of expired entries and orphans, as of `now`.
    pub fn evictable(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut keys: Vec<String> = self
            .functions
            .iter()
            .flat_map(|summary| summary.entries.iter())
            .filter(|entry| entry.record.is_expired_at(now) || !entry.artifact_present)
            .flat_map(|entry| [entry.key.to_string(), entry.key.metadata_key()])
            .chain(self.orphans.iter().cloned())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// Deletes `keys` in parallel and returns the ones deleted. Keys that
/// vanished meanwhile are skipped.
pub fn remove_keys(storage: &dyn Storage, keys: Vec<String>) -> CacheResult<Vec<String>> {
    let removed: Vec<Option<String>> = keys
        .into_par_iter()
        .map(|key| match storage.remove(&key) {
            Ok(()) => Ok(Some(key)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        })
        .collect::<CacheResult<_>>()?;
    Ok(removed.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::storage::{LocalStorage, OpenMode};

    #[test]
    fn removal_skips_keys_that_are_already_gone() -> CacheResult<()> {
        let dir = tempfile::tempdir().map_err(|err| crate::CacheError::io("tempdir", err))?;
        let storage = LocalStorage::new(dir.path());
        for key in ["a.1", "a.2"] {
            let mut writer = storage.open(key, OpenMode::WRITE_TEXT)?.into_writer(key)?;
            writer
                .write_all(b"x")
                .map_err(|err| crate::CacheError::io(key, err))?;
            writer.commit()?;
        }

        let keys = vec!["a.1".to_string(), "a.2".to_string(), "a.3".to_string(), "a.1".to_string()];
        let mut removed = remove_keys(&storage, keys)?;
        removed.sort();
        assert_eq!(removed, vec!["a.1", "a.2"]);
        assert!(storage.all()?.is_empty());
        Ok(())
    }
}
