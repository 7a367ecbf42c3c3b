use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::identity::{ExecutionIdentity, FunctionIdentity};
use crate::storage::{OpenMode, Storage};

/// Bookkeeping stored next to every artifact, as YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub function: FunctionIdentity,
    pub parameters: BTreeMap<String, String>,
    pub executed_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl CacheRecord {
    pub fn new(
        function: FunctionIdentity,
        execution: &ExecutionIdentity,
        expired_at: Option<DateTime<Utc>>,
    ) -> Self {
        let parameters = execution
            .parameters()
            .iter()
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect();
        Self {
            function,
            parameters,
            executed_at: Utc::now(),
            expired_at,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expired_at.is_some_and(|expired_at| expired_at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn write_to(&self, storage: &dyn Storage, key: &str) -> CacheResult<()> {
        let mut writer = storage.open(key, OpenMode::WRITE_TEXT)?.into_writer(key)?;
        serde_yaml::to_writer(&mut writer, self)
            .map_err(|err| CacheError::serialization(format!("failed to write cache record: {err}")))?;
        writer.commit()
    }

    pub fn read_from(storage: &dyn Storage, key: &str) -> CacheResult<Self> {
        let reader = storage.open(key, OpenMode::READ_TEXT)?.into_reader(key)?;
        serde_yaml::from_reader(reader)
            .map_err(|err| CacheError::serialization(format!("failed to read cache record: {err}")))
    }
}
