use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::clock::ManualClock;
use crate::collector::ReadingCollector;
use crate::config::{CacheConfig, PollerConfig};
use crate::manager::{CacheManager, IngestMode};
use crate::poller::{PollFailure, Poller};
use crate::reading::{FieldValue, Reading};
use crate::registry::{DeviceConfig, DeviceRegistry, RegistryError, StaticSource};
use crate::store::InMemoryRollupStore;

/// Hands out a canned reading per device id.
struct CannedCollector {
    readings: BTreeMap<String, Reading>,
}

#[async_trait]
impl ReadingCollector for CannedCollector {
    async fn collect(&self, device: &DeviceConfig) -> Reading {
        self.readings
            .get(&device.id)
            .cloned()
            .unwrap_or_else(|| Reading::sentinel("NO_DATA", "no canned reading"))
    }
}

fn ok_reading(power: f64) -> Reading {
    Reading::from_fields([
        ("ups.status", FieldValue::from("OL")),
        ("ups.load", FieldValue::from(30.0)),
        ("ups.realpower", FieldValue::from(power)),
    ])
}

fn poller(devices: Vec<DeviceConfig>, readings: &[(&str, Reading)]) -> Poller<CannedCollector> {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 30)
            .single()
            .expect("valid date"),
    ));
    let manager = Arc::new(CacheManager::new(
        CacheConfig::default(),
        Arc::new(InMemoryRollupStore::new()),
        clock,
    ));
    let registry = Arc::new(DeviceRegistry::new(StaticSource::new(devices)));
    let collector = CannedCollector {
        readings: readings
            .iter()
            .map(|(id, reading)| (id.to_string(), reading.clone()))
            .collect(),
    };
    Poller::new(collector, registry, manager, PollerConfig::default())
}

#[tokio::test]
async fn single_device_is_ingested_in_single_mode() {
    // Arrange
    let mut poller = poller(
        vec![DeviceConfig::new("ups", "ups", "localhost")],
        &[("ups", ok_reading(120.0))],
    );

    // Act
    let outcome = poller.tick().await.expect("poll");

    // Assert
    assert_eq!(outcome.mode, IngestMode::Single);
    assert_eq!(outcome.devices, 1);
    assert!(outcome.report.published);
    assert_eq!(poller.manager().buffer_len().await, 1);
    assert_eq!(poller.counters(), (1, 0));
}

#[tokio::test]
async fn unavailable_single_device_is_not_buffered() {
    // Arrange
    let mut poller = poller(vec![DeviceConfig::new("ups", "ups", "localhost")], &[]);

    // Act
    let result = poller.tick().await;

    // Assert
    match result {
        Err(PollFailure::Unavailable { device, status, .. }) => {
            assert_eq!(device, "ups");
            assert_eq!(status, "NO_DATA");
        }
        other => panic!("unexpected poll result: {other:?}"),
    }
    assert_eq!(poller.manager().buffer_len().await, 0);
    assert_eq!(poller.counters(), (0, 1));
}

#[tokio::test]
async fn several_devices_are_aggregated_with_metadata() {
    // Arrange
    let mut primary = DeviceConfig::new("rack-a", "racka", "10.0.0.1");
    primary.is_primary = true;
    primary.friendly_name = Some("Rack A".into());
    let secondary = DeviceConfig::new("rack-b", "rackb", "10.0.0.2");
    let mut poller = poller(
        vec![primary, secondary],
        &[("rack-a", ok_reading(100.0)), ("rack-b", ok_reading(50.0))],
    );

    // Act
    let outcome = poller.tick().await.expect("poll");

    // Assert
    assert_eq!(outcome.mode, IngestMode::Multi);
    assert_eq!(outcome.devices, 2);

    let view = poller.manager().latest_multi_view().await.expect("multi view");
    assert_eq!(view.aggregated.number("ups_realpower"), Some(150.0));
    let rack_a = view.individual.get("rack-a").expect("rack-a view");
    assert_eq!(rack_a.fields.get("friendly_name"), Some(&FieldValue::Text("Rack A".into())));
    assert_eq!(rack_a.fields.get("is_primary"), Some(&FieldValue::Flag(true)));
    assert_eq!(rack_a.fields.get("ups_name"), Some(&FieldValue::Text("racka".into())));
}

#[tokio::test]
async fn failed_device_still_counts_in_multi_mode() {
    // Arrange
    let mut poller = poller(
        vec![
            DeviceConfig::new("rack-a", "racka", "10.0.0.1"),
            DeviceConfig::new("rack-b", "rackb", "10.0.0.2"),
        ],
        &[("rack-a", ok_reading(100.0))],
    );

    // Act
    poller.tick().await.expect("poll");

    // Assert
    let view = poller.manager().latest_multi_view().await.expect("multi view");
    assert_eq!(view.ups_count, 2);
    assert_eq!(view.aggregated.number("ups_offline_count"), Some(1.0));
    assert_eq!(view.individual["rack-b"].status(), Some("NO_DATA"));
}

#[tokio::test]
async fn no_enabled_devices_is_a_configuration_failure() {
    let mut poller = poller(Vec::new(), &[]);

    let result = poller.tick().await;

    assert!(matches!(
        result,
        Err(PollFailure::Configuration(RegistryError::NoEnabledDevices))
    ));
}

fn status_reading(status: &str, power: f64) -> Reading {
    Reading::from_fields([
        ("ups.status", FieldValue::from(status)),
        ("ups.realpower", FieldValue::from(power)),
    ])
}

#[tokio::test]
async fn status_ties_follow_display_order() {
    // Arrange
    let mut first = DeviceConfig::new("z-rack", "zrack", "10.0.0.1");
    first.order_index = 0;
    let mut second = DeviceConfig::new("a-rack", "arack", "10.0.0.2");
    second.order_index = 1;
    let mut poller = poller(
        vec![second, first],
        &[
            ("z-rack", status_reading("OB LB", 80.0)),
            ("a-rack", status_reading("OB", 40.0)),
        ],
    );

    // Act
    let outcome = poller.tick().await.expect("poll");

    // Assert
    assert_eq!(outcome.report.view.status(), Some("OB LB"));
    let view = poller.manager().latest_multi_view().await.expect("multi view");
    assert_eq!(view.aggregated.status(), Some("OB LB"));
}

#[tokio::test]
async fn outcome_carries_the_aggregate_of_every_poll() {
    // Arrange
    let mut poller = poller(
        vec![
            DeviceConfig::new("rack-a", "racka", "10.0.0.1"),
            DeviceConfig::new("rack-b", "rackb", "10.0.0.2"),
        ],
        &[("rack-a", ok_reading(100.0)), ("rack-b", ok_reading(50.0))],
    );
    poller.tick().await.expect("first poll");

    // Act
    let outcome = poller.tick().await.expect("second poll");

    // Assert
    assert!(!outcome.report.published, "unchanged readings are not republished");
    assert_eq!(outcome.report.view.number("ups_realpower"), Some(150.0));
    assert_eq!(outcome.report.view.number("ups_count"), Some(2.0));
}
