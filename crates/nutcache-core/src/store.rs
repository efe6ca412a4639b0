//! Rollup persistence.
//!
//! The cache manager writes finished rollups through [`RollupStore`] and
//! reads minute/hourly rollups back for the hour and day reductions.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::rollup::RollupRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to acquire lock on rollup store")]
    Lock,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait RollupStore: Send + Sync {
    async fn persist(&self, record: &RollupRecord) -> Result<(), StoreError>;

    /// Records with `start <= timestamp < end`, in timestamp order.
    async fn query(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RollupRecord>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryRollupStore {
    records: RwLock<Vec<RollupRecord>>,
}

impl InMemoryRollupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Result<Vec<RollupRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Lock)?;
        Ok(records.clone())
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RollupStore for InMemoryRollupStore {
    async fn persist(&self, record: &RollupRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Lock)?;
        records.push(record.clone());
        Ok(())
    }

    async fn query(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RollupRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Lock)?;
        let mut matched: Vec<RollupRecord> = records
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp < end)
            .cloned()
            .collect();
        matched.sort_by_key(|r| r.timestamp);
        Ok(matched)
    }
}
