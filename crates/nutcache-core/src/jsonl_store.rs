use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use tracing::{debug, warn};

use crate::rollup::RollupRecord;
use crate::store::{RollupStore, StoreError};

const FILE_PREFIX: &str = "rollups-";
const FILE_SUFFIX: &str = ".jsonl";

/// Append-only rollup log, one file per UTC day of the record timestamp.
pub struct JsonlRollupStore {
    out_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlRollupStore {
    pub fn open(out_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let out_dir = out_dir.into();
        fs::create_dir_all(&out_dir)?;
        Ok(Self {
            out_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.out_dir
    }

    fn day_path(&self, day: NaiveDate) -> PathBuf {
        self.out_dir
            .join(format!("{FILE_PREFIX}{}{FILE_SUFFIX}", day.format("%Y-%m-%d")))
    }

    fn read_day(&self, day: NaiveDate) -> Result<Vec<RollupRecord>, StoreError> {
        let path = self.day_path(day);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(fs::File::open(&path)?);
        let mut records = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RollupRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(path = %path.display(), line = idx + 1, error = %err, "skipping malformed rollup line")
                }
            }
        }
        Ok(records)
    }

    /// Deletes day files older than `retention_days`; the file exactly on the
    /// cutoff day is kept.
    pub fn prune(&self, retention_days: u64, now: SystemTime) -> Result<usize, StoreError> {
        prune_old_rollup_files(&self.out_dir, retention_days, now)
    }
}

#[async_trait]
impl RollupStore for JsonlRollupStore {
    async fn persist(&self, record: &RollupRecord) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Lock)?;

        let path = self.day_path(record.timestamp.date_naive());
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }

    async fn query(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RollupRecord>, StoreError> {
        if end <= start {
            return Ok(Vec::new());
        }

        let first_day = start.date_naive();
        let last_day = (end - chrono::Duration::nanoseconds(1)).date_naive();

        let mut matched = Vec::new();
        let mut day = first_day;
        while day <= last_day {
            matched.extend(
                self.read_day(day)?
                    .into_iter()
                    .filter(|r| r.timestamp >= start && r.timestamp < end),
            );
            let Some(next) = day.succ_opt() else {
                break;
            };
            day = next;
        }

        matched.sort_by_key(|r| r.timestamp);
        debug!(%start, %end, records = matched.len(), "rollup range query");
        Ok(matched)
    }
}

pub fn prune_old_rollup_files(
    out_dir: &Path,
    retention_days: u64,
    now: SystemTime,
) -> Result<usize, StoreError> {
    let today = DateTime::<Utc>::from(now).date_naive();
    let cutoff = today
        .checked_sub_days(Days::new(retention_days))
        .unwrap_or(today);

    let mut removed = 0;
    for entry in fs::read_dir(out_dir)? {
        let path = entry?.path();
        let Some(date_part) = path
            .file_name()
            .and_then(|v| v.to_str())
            .and_then(|n| n.strip_prefix(FILE_PREFIX))
            .and_then(|n| n.strip_suffix(FILE_SUFFIX))
        else {
            continue;
        };

        let Ok(file_date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };

        if file_date < cutoff {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) => warn!(path = %path.display(), error = %err, "failed to prune rollup file"),
            }
        }
    }

    Ok(removed)
}
