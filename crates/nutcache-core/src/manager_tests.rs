use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::aggregate::DeviceReadings;
use crate::clock::ManualClock;
use crate::config::CacheConfig;
use crate::manager::{CacheError, CacheManager, FlushOutcome, IngestMode};
use crate::publisher::Notification;
use crate::reading::{FieldValue, Reading};
use crate::rollup::RollupRecord;
use crate::store::{InMemoryRollupStore, RollupStore, StoreError};

fn at(day: u32, hour: u32, min: u32, sec: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, hour, min, sec)
        .single()
        .expect("valid date")
}

fn reading(status: &str, load: f64, power: f64) -> Reading {
    Reading::from_fields([
        ("ups.status", FieldValue::from(status)),
        ("ups.load", load.into()),
        ("ups.realpower", power.into()),
    ])
}

/// In-memory store whose writes can be made to fail.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryRollupStore,
    failing: AtomicBool,
}

impl FlakyStore {
    fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RollupStore for FlakyStore {
    async fn persist(&self, record: &RollupRecord) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk full".into()));
        }
        self.inner.persist(record).await
    }

    async fn query(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<RollupRecord>, StoreError> {
        self.inner.query(start, end).await
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<FlakyStore>,
    manager: CacheManager,
}

fn harness(start: DateTime<Utc>) -> Harness {
    let clock = Arc::new(ManualClock::new(start));
    let store = Arc::new(FlakyStore::default());
    let manager = CacheManager::new(CacheConfig::default(), store.clone(), clock.clone());
    Harness { clock, store, manager }
}

impl Harness {
    async fn ingest(&self, now: DateTime<Utc>, reading: Reading) -> crate::manager::IngestReport {
        self.clock.set(now);
        self.manager.add_single(now, reading).await.expect("ingest")
    }

    fn records(&self) -> Vec<RollupRecord> {
        self.store.inner.records().expect("records")
    }
}

#[tokio::test]
async fn minute_rollup_is_stamped_at_the_boundary() {
    // Arrange
    let h = harness(at(2, 12, 0, 30));
    let first = h.ingest(at(2, 12, 0, 30), reading("OL", 40.0, 100.0)).await;
    assert_eq!(first.flush, FlushOutcome::NotDue);

    // Act
    let report = h.ingest(at(2, 12, 1, 2), reading("OL", 60.0, 200.0)).await;

    // Assert
    assert_eq!(
        report.flush,
        FlushOutcome::Persisted {
            boundary: at(2, 12, 1, 0),
            samples: 2,
            hourly_power: None,
        }
    );
    let records = h.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].timestamp, at(2, 12, 1, 0));
    assert_eq!(records[0].realpower(), Some(150.0));
    let minute = records[0].minute.as_ref().expect("minute fields");
    assert_eq!(minute.get("ups_load"), Some(&FieldValue::Number(50.0)));
    assert_eq!(h.manager.buffer_len().await, 0);
}

#[tokio::test]
async fn boundary_is_flushed_once() {
    // Arrange
    let h = harness(at(2, 12, 0, 30));
    h.ingest(at(2, 12, 0, 30), reading("OL", 40.0, 100.0)).await;
    h.ingest(at(2, 12, 1, 0), reading("OL", 40.0, 100.0)).await;

    // Act
    let again = h.ingest(at(2, 12, 1, 0), reading("OL", 40.0, 100.0)).await;

    // Assert
    assert_eq!(again.flush, FlushOutcome::NotDue);
    assert_eq!(h.records().len(), 1);
    assert_eq!(h.manager.buffer_len().await, 1);
}

#[tokio::test]
async fn failed_persist_keeps_buffer_and_boundary_for_retry() {
    // Arrange
    let h = harness(at(2, 12, 0, 30));
    h.ingest(at(2, 12, 0, 30), reading("OL", 40.0, 100.0)).await;
    h.store.fail(true);

    // Act
    let failed = h.ingest(at(2, 12, 1, 5), reading("OL", 40.0, 100.0)).await;

    // Assert
    assert!(matches!(failed.flush, FlushOutcome::Failed { .. }));
    assert_eq!(h.manager.buffer_len().await, 2);
    assert_eq!(
        h.manager.scheduler_state().await.next_minute_boundary,
        Some(at(2, 12, 1, 0))
    );

    // Act
    h.store.fail(false);
    let retried = h.ingest(at(2, 12, 1, 10), reading("OL", 40.0, 100.0)).await;

    // Assert
    assert_eq!(
        retried.flush,
        FlushOutcome::Persisted {
            boundary: at(2, 12, 1, 0),
            samples: 3,
            hourly_power: None,
        }
    );
    assert_eq!(h.manager.buffer_len().await, 0);
    assert_eq!(
        h.manager.scheduler_state().await.next_minute_boundary,
        Some(at(2, 12, 2, 0))
    );
}

#[tokio::test]
async fn stall_resyncs_minute_timer() {
    // Arrange
    let h = harness(at(2, 12, 0, 30));
    h.ingest(at(2, 12, 0, 30), reading("OL", 40.0, 100.0)).await;

    // Act
    let late = h.ingest(at(2, 12, 5, 30), reading("OL", 40.0, 100.0)).await;
    let next = h.ingest(at(2, 12, 5, 40), reading("OL", 40.0, 100.0)).await;

    // Assert
    assert!(matches!(late.flush, FlushOutcome::Persisted { boundary, .. } if boundary == at(2, 12, 1, 0)));
    assert_eq!(next.flush, FlushOutcome::NotDue);
    assert_eq!(
        h.manager.scheduler_state().await.next_minute_boundary,
        Some(at(2, 12, 6, 0))
    );
    assert_eq!(h.records().len(), 1);
}

#[tokio::test]
async fn hourly_power_is_attached_at_the_hour() {
    // Arrange
    let h = harness(at(2, 12, 58, 10));
    h.ingest(at(2, 12, 58, 10), reading("OL", 10.0, 100.0)).await;
    h.ingest(at(2, 12, 59, 0), reading("OL", 10.0, 100.0)).await;

    // Act
    let report = h.ingest(at(2, 13, 0, 0), reading("OL", 20.0, 200.0)).await;

    // Assert
    assert_eq!(
        report.flush,
        FlushOutcome::Persisted {
            boundary: at(2, 13, 0, 0),
            samples: 1,
            hourly_power: Some(100.0),
        }
    );
    let records = h.records();
    let last = records.last().expect("hour record");
    assert_eq!(last.hourly_power, Some(100.0));
    assert_eq!(last.realpower(), Some(200.0));
    assert_eq!(
        h.manager.scheduler_state().await.next_hour_boundary,
        Some(at(2, 14, 0, 0))
    );
}

#[tokio::test]
async fn daily_power_is_written_after_the_daily_boundary() {
    // Arrange
    let h = harness(at(2, 3, 58, 30));
    for (hour, power) in [(10, 100.0), (11, 200.0)] {
        let mut record = RollupRecord::minute(at(1, hour, 0, 0), Default::default());
        record.hourly_power = Some(power);
        h.store.persist(&record).await.expect("seed hourly record");
    }
    h.ingest(at(2, 3, 58, 30), reading("OL", 10.0, 100.0)).await;
    let armed = h.ingest(at(2, 3, 59, 0), reading("OL", 10.0, 100.0)).await;
    assert_eq!(armed.daily, None);

    // Act
    let report = h.ingest(at(2, 4, 0, 0), reading("OL", 10.0, 100.0)).await;

    // Assert
    assert_eq!(report.daily, Some(at(1, 0, 0, 0)));
    let daily: Vec<RollupRecord> = h.records().into_iter().filter(|r| r.daily_power.is_some()).collect();
    assert_eq!(daily.len(), 1);
    assert_eq!(daily[0].timestamp, at(1, 0, 0, 0));
    assert_eq!(daily[0].daily_power, Some(150.0));
    assert_eq!(
        h.manager.scheduler_state().await.next_daily_boundary,
        Some(at(3, 4, 0, 0))
    );
}

#[tokio::test]
async fn out_of_order_sample_is_rejected() {
    // Arrange
    let h = harness(at(2, 12, 0, 30));
    h.ingest(at(2, 12, 0, 30), reading("OL", 40.0, 100.0)).await;

    // Act
    let result = h.manager.add_single(at(2, 12, 0, 10), reading("OL", 40.0, 100.0)).await;

    // Assert
    assert!(matches!(result, Err(CacheError::OutOfOrder { .. })));
    assert_eq!(h.manager.buffer_len().await, 1);
}

#[tokio::test]
async fn resize_applies_on_next_ingestion_and_keeps_entries() {
    // Arrange
    let h = harness(at(2, 12, 0, 1));
    for sec in 1..=6 {
        h.ingest(at(2, 12, 0, sec), reading("OL", 40.0, 100.0)).await;
    }

    // Act
    h.manager.set_sampling_interval(10).await;
    let before = h.manager.capacity().await;
    h.ingest(at(2, 12, 0, 7), reading("OL", 40.0, 100.0)).await;

    // Assert
    assert_eq!(before, 60);
    assert_eq!(h.manager.capacity().await, 6);
    assert_eq!(h.manager.buffer_len().await, 7);
    assert!(h.manager.is_buffer_full().await);
}

#[tokio::test]
async fn single_mode_notifies_observers() {
    // Arrange
    let h = harness(at(2, 12, 0, 30));
    let mut rx = h.manager.subscribe();

    // Act
    let report = h.ingest(at(2, 12, 0, 30), reading("OL", 40.0, 100.0)).await;

    // Assert
    assert!(report.published);
    assert!(matches!(rx.try_recv(), Ok(Notification::CacheUpdate(_))));
    assert_eq!(h.manager.mode().await, Some(IngestMode::Single));
    let view = h.manager.latest_view().await.expect("latest view");
    assert_eq!(view.number("ups_load"), Some(40.0));
}

#[tokio::test]
async fn multi_mode_rolls_up_aggregate_and_clears_devices() {
    // Arrange
    let h = harness(at(2, 12, 0, 30));
    let mut rx = h.manager.subscribe();
    let devices = |power_a: f64, power_b: f64| {
        let mut readings = DeviceReadings::new();
        readings.insert("ups-a".to_string(), reading("OL", 40.0, power_a));
        readings.insert("ups-b".to_string(), reading("OB", 60.0, power_b));
        readings
    };

    // Act
    let first = h
        .manager
        .add_multi(at(2, 12, 0, 30), devices(100.0, 50.0))
        .await
        .expect("first multi ingest");
    let summary = h.manager.device_summary("ups-a").await;
    h.clock.set(at(2, 12, 1, 0));
    let second = h
        .manager
        .add_multi(at(2, 12, 1, 0), devices(120.0, 70.0))
        .await
        .expect("second multi ingest");

    // Assert
    assert!(first.published);
    match rx.try_recv().expect("multi notification") {
        Notification::MultiUpsUpdate(view) => {
            assert_eq!(view.ups_count, 2);
            assert_eq!(view.aggregated.status(), Some("OB"));
            assert_eq!(view.aggregated.number("ups_realpower"), Some(150.0));
        }
        other => panic!("unexpected notification: {other:?}"),
    }
    assert_eq!(
        summary.and_then(|s| s.get("ups_realpower").cloned()),
        Some(FieldValue::Number(100.0))
    );

    assert!(matches!(second.flush, FlushOutcome::Persisted { samples: 2, .. }));
    let records = h.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].realpower(), Some(170.0));
    let minute = records[0].minute.as_ref().expect("minute fields");
    assert_eq!(minute.get("ups_count"), Some(&FieldValue::Number(2.0)));
    assert_eq!(minute.get("is_aggregated"), Some(&FieldValue::Flag(true)));

    assert_eq!(h.manager.mode().await, Some(IngestMode::Multi));
    assert_eq!(h.manager.buffer_len().await, 0);
    assert!(h.manager.device_summary("ups-a").await.is_none());
}

#[tokio::test]
async fn concurrent_ingestions_flush_a_boundary_once() {
    // Arrange
    let h = harness(at(2, 12, 0, 30));
    h.ingest(at(2, 12, 0, 30), reading("OL", 40.0, 100.0)).await;
    let now = at(2, 12, 1, 5);
    h.clock.set(now);

    // Act
    let (left, right) = tokio::join!(
        h.manager.add_single(now, reading("OL", 40.0, 100.0)),
        h.manager.add_single(now, reading("OL", 40.0, 100.0)),
    );

    // Assert
    let flushes = [left.expect("left ingest").flush, right.expect("right ingest").flush];
    let persisted = flushes
        .iter()
        .filter(|f| matches!(f, FlushOutcome::Persisted { .. }))
        .count();
    assert_eq!(persisted, 1);
    assert!(flushes.contains(&FlushOutcome::NotDue));
    assert_eq!(h.records().len(), 1);
    assert_eq!(h.manager.buffer_len().await, 1);
}

#[tokio::test]
async fn mode_change_drops_samples_buffered_under_the_other_mode() {
    // Arrange
    let h = harness(at(2, 12, 0, 10));
    h.ingest(at(2, 12, 0, 10), reading("OL", 90.0, 1000.0)).await;
    let mut readings = DeviceReadings::new();
    readings.insert("ups-a".to_string(), reading("OL", 40.0, 500.0));
    readings.insert("ups-b".to_string(), reading("OL", 60.0, 500.0));
    h.clock.set(at(2, 12, 0, 20));
    h.manager
        .add_multi(at(2, 12, 0, 20), readings)
        .await
        .expect("multi ingest");

    // Act
    h.ingest(at(2, 12, 0, 30), reading("OL", 40.0, 100.0)).await;
    let report = h.ingest(at(2, 12, 1, 0), reading("OL", 60.0, 200.0)).await;

    // Assert
    assert!(matches!(report.flush, FlushOutcome::Persisted { samples: 2, .. }));
    let records = h.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].realpower(), Some(150.0), "earlier single sample is gone");
    assert!(h.manager.device_summary("ups-a").await.is_none());
}

#[tokio::test]
async fn report_carries_the_ingested_view_even_when_not_published() {
    // Arrange
    let h = harness(at(2, 12, 0, 10));
    h.ingest(at(2, 12, 0, 10), reading("OL", 40.0, 100.0)).await;

    // Act
    let report = h.ingest(at(2, 12, 0, 20), reading("OL", 40.0, 100.4)).await;

    // Assert
    assert!(!report.published);
    assert_eq!(report.view.number("ups_realpower"), Some(100.4));
    let published = h.manager.latest_view().await.expect("latest view");
    assert_eq!(published.number("ups_realpower"), Some(100.0));
}
