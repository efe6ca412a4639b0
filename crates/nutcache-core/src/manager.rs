//! Ingestion, buffering and rollup orchestration.
//!
//! All buffer, scheduler and publisher state sits behind one async mutex that
//! is held for append + conditional flush, persistence included. A flush
//! either completes (rollup persisted, buffer cleared, boundary advanced) or
//! leaves everything as it was so the next ingestion retries.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::aggregate::{aggregate, DeviceReadings};
use crate::buffer::DeviceBuffer;
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::publisher::{ChangeGate, MultiView, Notification, Publisher, View};
use crate::reading::{FieldMap, Reading};
use crate::reduce::round_to;
use crate::rollup::RollupRecord;
use crate::scheduler::{midnight, RollupScheduler, SchedulerState};
use crate::store::{RollupStore, StoreError};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("sample at {ts} for {source_id} is older than buffered sample at {last}")]
    OutOfOrder {
        source_id: String,
        ts: DateTime<Utc>,
        last: DateTime<Utc>,
    },
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

const SINGLE_SOURCE: &str = "single";
const AGGREGATE_SOURCE: &str = "aggregate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    Single,
    Multi,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlushOutcome {
    NotDue,
    /// Boundary reached with nothing buffered.
    Skipped,
    Persisted {
        boundary: DateTime<Utc>,
        samples: usize,
        hourly_power: Option<f64>,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    /// What was ingested: the reading itself, or the aggregate in multi mode.
    pub view: View,
    pub published: bool,
    pub flush: FlushOutcome,
    pub daily: Option<DateTime<Utc>>,
}

struct CacheState {
    capacity: usize,
    pending_capacity: Option<usize>,
    mode: Option<IngestMode>,
    single: DeviceBuffer,
    devices: BTreeMap<String, DeviceBuffer>,
    aggregate: DeviceBuffer,
    scheduler: RollupScheduler,
    /// Minute-rollup real power since the last hourly rollup.
    hour_samples: Vec<(DateTime<Utc>, f64)>,
    publisher: Publisher,
}

impl CacheState {
    fn active_buffer(&self) -> &DeviceBuffer {
        match self.mode {
            Some(IngestMode::Multi) => &self.aggregate,
            _ => &self.single,
        }
    }

    fn apply_pending_capacity(&mut self) {
        if let Some(capacity) = self.pending_capacity.take() {
            if capacity != self.capacity {
                info!(from = self.capacity, to = capacity, "adjusting cache buffer size");
                self.capacity = capacity;
            }
        }
    }

    /// Records the mode of the latest ingestion. Samples buffered under the
    /// other mode are dropped so they never reach a later rollup.
    fn switch_mode(&mut self, mode: IngestMode) {
        match self.mode.replace(mode) {
            Some(previous) if previous != mode => {
                info!(?previous, current = ?mode, "ingestion mode changed, dropping buffered samples");
                self.clear_mode(previous);
            }
            _ => {}
        }
    }

    fn clear_mode(&mut self, mode: IngestMode) {
        match mode {
            IngestMode::Multi => {
                self.aggregate.clear();
                for buffer in self.devices.values_mut() {
                    buffer.clear();
                }
            }
            IngestMode::Single => self.single.clear(),
        }
    }

    fn clear_active(&mut self) {
        if let Some(mode) = self.mode {
            self.clear_mode(mode);
        }
    }
}

pub struct CacheManager {
    config: CacheConfig,
    store: Arc<dyn RollupStore>,
    clock: Arc<dyn Clock>,
    notifier: broadcast::Sender<Notification>,
    state: Mutex<CacheState>,
}

impl CacheManager {
    pub fn new(config: CacheConfig, store: Arc<dyn RollupStore>, clock: Arc<dyn Clock>) -> Self {
        let gate = ChangeGate::new(config.change_threshold, config.watched_fields.clone());
        let publisher = Publisher::new(gate, config.notification_capacity);
        let notifier = publisher.sender();
        let capacity = config.initial_capacity.max(config.min_capacity);

        info!(capacity, cache_seconds = config.cache_seconds, "initialized rollup cache");

        Self {
            state: Mutex::new(CacheState {
                capacity,
                pending_capacity: None,
                mode: None,
                single: DeviceBuffer::new(),
                devices: BTreeMap::new(),
                aggregate: DeviceBuffer::new(),
                scheduler: RollupScheduler::new(config.daily_hour_utc),
                hour_samples: Vec::new(),
                publisher,
            }),
            config,
            store,
            clock,
            notifier,
        }
    }

    /// Wall-clock time as seen by the rollup scheduler.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Ingests one reading in single-device mode.
    pub async fn add_single(&self, ts: DateTime<Utc>, reading: Reading) -> Result<IngestReport, CacheError> {
        let mut state = self.state.lock().await;
        state.apply_pending_capacity();

        let now = self.clock.now();
        state.scheduler.prime(now);

        if let Err(last) = state.single.push(ts, reading.clone()) {
            return Err(CacheError::OutOfOrder {
                source_id: SINGLE_SOURCE.to_string(),
                ts,
                last,
            });
        }
        state.switch_mode(IngestMode::Single);
        debug!(buffer = state.single.len(), "added data point");

        let view = View::new(ts, reading.to_fields());
        let published = state.publisher.publish_single(view.clone());
        let (flush, daily) = self.flush_if_due(&mut state).await;

        Ok(IngestReport {
            view,
            published,
            flush,
            daily,
        })
    }

    /// Ingests the latest reading of every device: per-device buffers, the
    /// aggregate buffer, and one combined notification.
    pub async fn add_multi(&self, ts: DateTime<Utc>, readings: DeviceReadings) -> Result<IngestReport, CacheError> {
        let mut state = self.state.lock().await;
        state.apply_pending_capacity();

        let now = self.clock.now();
        state.scheduler.prime(now);

        let aggregated = aggregate(&readings);
        if let Err(last) = state.aggregate.push(ts, aggregated.to_reading()) {
            return Err(CacheError::OutOfOrder {
                source_id: AGGREGATE_SOURCE.to_string(),
                ts,
                last,
            });
        }

        for (id, reading) in readings.iter() {
            if let Err(last) = state.devices.entry(id.to_string()).or_default().push(ts, reading.clone()) {
                warn!(device = %id, %ts, %last, "dropping out-of-order device sample");
            }
        }
        state.switch_mode(IngestMode::Multi);
        debug!(
            devices = readings.len(),
            buffer = state.aggregate.len(),
            "added multi-device data"
        );

        let view = View::new(ts, aggregated.to_reading().to_fields());
        let individual = readings
            .iter()
            .map(|(id, reading)| (id.to_string(), View::new(ts, reading.to_fields())))
            .collect();
        let published = state.publisher.publish_multi(view.clone(), individual);
        let (flush, daily) = self.flush_if_due(&mut state).await;

        Ok(IngestReport {
            view,
            published,
            flush,
            daily,
        })
    }

    /// Resizes buffer capacity for a new sampling interval. Takes effect on
    /// the next ingestion; buffered entries are kept.
    pub async fn set_sampling_interval(&self, interval_secs: u64) {
        let capacity = self.config.capacity_for_interval(interval_secs);
        let mut state = self.state.lock().await;
        if capacity != state.capacity {
            state.pending_capacity = Some(capacity);
        }
    }

    pub async fn is_buffer_full(&self) -> bool {
        let state = self.state.lock().await;
        state.active_buffer().len() >= state.capacity
    }

    pub async fn capacity(&self) -> usize {
        self.state.lock().await.capacity
    }

    pub async fn buffer_len(&self) -> usize {
        self.state.lock().await.active_buffer().len()
    }

    pub async fn mode(&self) -> Option<IngestMode> {
        self.state.lock().await.mode
    }

    /// Mean/last-value summary of one device's buffered readings.
    pub async fn device_summary(&self, device_id: &str) -> Option<FieldMap> {
        let state = self.state.lock().await;
        state.devices.get(device_id).and_then(DeviceBuffer::summary)
    }

    pub async fn scheduler_state(&self) -> SchedulerState {
        self.state.lock().await.scheduler.state()
    }

    /// Last view actually sent to single-device observers.
    pub async fn latest_view(&self) -> Option<View> {
        self.state.lock().await.publisher.latest_view()
    }

    pub async fn latest_multi_view(&self) -> Option<MultiView> {
        self.state.lock().await.publisher.latest_multi_view()
    }

    async fn flush_if_due(&self, state: &mut CacheState) -> (FlushOutcome, Option<DateTime<Utc>>) {
        let now = self.clock.now();
        let flush = self.flush_minute(state, now).await;

        let daily = match flush {
            FlushOutcome::Persisted { .. } => self.aggregate_daily(state, now).await,
            _ => None,
        };

        (flush, daily)
    }

    async fn flush_minute(&self, state: &mut CacheState, now: DateTime<Utc>) -> FlushOutcome {
        let Some(boundary) = state.scheduler.minute_due(now) else {
            return FlushOutcome::NotDue;
        };

        let buffer = state.active_buffer();
        let samples = buffer.len();
        let Some(fields) = buffer.summary() else {
            warn!(%boundary, "no data available for averaging");
            return FlushOutcome::Skipped;
        };

        let mut record = RollupRecord::minute(boundary, fields);
        let realpower = record.realpower();

        let hour_boundary = state.scheduler.hour_due(now);
        if let Some(hour_end) = hour_boundary {
            match self.hourly_power(hour_end, &state.hour_samples).await {
                Ok(power) => record.hourly_power = power,
                Err(err) => {
                    error!(%hour_end, error = %err, "hourly power query failed, flush aborted");
                    return FlushOutcome::Failed {
                        reason: err.to_string(),
                    };
                }
            }
        }

        if let Err(err) = self.store.persist(&record).await {
            error!(%boundary, samples, error = %err, "failed to persist minute rollup");
            return FlushOutcome::Failed {
                reason: err.to_string(),
            };
        }

        info!(
            %boundary,
            samples,
            realpower = ?realpower,
            hourly_power = ?record.hourly_power,
            "minute rollup persisted"
        );

        state.clear_active();
        state.scheduler.advance_minute(now);
        if hour_boundary.is_some() {
            state.hour_samples.clear();
            state.scheduler.advance_hour(now);
        }
        if let Some(power) = realpower {
            state.hour_samples.push((boundary, power));
        }

        FlushOutcome::Persisted {
            boundary,
            samples,
            hourly_power: record.hourly_power,
        }
    }

    /// Average real power of the minute rollups in the hour ending at
    /// `hour_end`. Falls back to the in-memory samples when none were
    /// persisted in that window.
    async fn hourly_power(
        &self,
        hour_end: DateTime<Utc>,
        hour_samples: &[(DateTime<Utc>, f64)],
    ) -> Result<Option<f64>, StoreError> {
        let hour_start = hour_end - Duration::hours(1);
        let mut powers: Vec<f64> = self
            .store
            .query(hour_start, hour_end)
            .await?
            .iter()
            .filter_map(RollupRecord::realpower)
            .collect();

        if powers.is_empty() {
            powers = hour_samples
                .iter()
                .filter(|(ts, _)| *ts >= hour_start && *ts < hour_end)
                .map(|(_, power)| *power)
                .collect();
        }

        if powers.is_empty() {
            warn!(%hour_end, "no power data available for hourly average");
            return Ok(None);
        }

        let average = round_to(powers.iter().sum::<f64>() / powers.len() as f64, 2);
        info!(%hour_end, records = powers.len(), average, "hourly power calculated");
        Ok(Some(average))
    }

    /// Persists the previous UTC day's average of hourly power once the daily
    /// boundary is reached. Failures are logged and retried on the next
    /// successful flush; they never undo the minute rollup.
    async fn aggregate_daily(&self, state: &mut CacheState, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        state.scheduler.daily_due(now)?;

        let day_end = midnight(now);
        let day_start = day_end - Duration::days(1);

        let hourly = match self.store.query(day_start, day_end).await {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "daily aggregation query failed");
                return None;
            }
        };

        let powers: Vec<f64> = hourly.iter().filter_map(|r| r.hourly_power).collect();
        if powers.is_empty() {
            warn!(day = %day_start.date_naive(), "no hourly data found for daily aggregation");
            state.scheduler.advance_daily(now);
            return None;
        }

        let average = round_to(powers.iter().sum::<f64>() / powers.len() as f64, 2);
        match self.store.persist(&RollupRecord::daily(day_start, average)).await {
            Ok(()) => {
                info!(day = %day_start.date_naive(), average, "daily aggregation saved");
                state.scheduler.advance_daily(now);
                Some(day_start)
            }
            Err(err) => {
                error!(error = %err, "failed to persist daily aggregation");
                None
            }
        }
    }
}
