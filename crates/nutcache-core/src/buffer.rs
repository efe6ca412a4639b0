use chrono::{DateTime, Utc};

use crate::reading::{FieldMap, Reading};
use crate::reduce::reduce;

/// Raw readings for one device since the last successful rollup, oldest first.
///
/// Entries are never evicted; the cache manager clears the whole buffer once
/// the rollup built from it has been persisted.
#[derive(Debug, Clone, Default)]
pub struct DeviceBuffer {
    entries: Vec<(DateTime<Utc>, Reading)>,
}

impl DeviceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a reading. A timestamp older than the newest entry is refused
    /// and handed back as `Err(last_ts)`.
    pub fn push(&mut self, ts: DateTime<Utc>, reading: Reading) -> Result<(), DateTime<Utc>> {
        if let Some((last, _)) = self.entries.last() {
            if ts < *last {
                return Err(*last);
            }
        }
        self.entries.push((ts, reading));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&(DateTime<Utc>, Reading)> {
        self.entries.last()
    }

    pub fn readings(&self) -> impl Iterator<Item = &Reading> {
        self.entries.iter().map(|(_, reading)| reading)
    }

    pub fn summary(&self) -> Option<FieldMap> {
        reduce(self.readings())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
