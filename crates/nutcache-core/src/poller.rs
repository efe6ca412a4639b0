use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::aggregate::DeviceReadings;
use crate::collector::ReadingCollector;
use crate::config::PollerConfig;
use crate::manager::{CacheError, CacheManager, IngestMode, IngestReport};
use crate::reading::FieldValue;
use crate::registry::{DeviceConfig, DeviceRegistry, RegistryError};

/// Why a poll cycle produced nothing. Returned, never raised: the caller just
/// polls again on its own cadence.
#[derive(Debug, Error)]
pub enum PollFailure {
    #[error(transparent)]
    Configuration(#[from] RegistryError),
    #[error("UPS {device} unavailable ({status}): {reason}")]
    Unavailable {
        device: String,
        status: String,
        reason: String,
    },
    #[error(transparent)]
    Rejected(#[from] CacheError),
}

#[derive(Debug, Clone, Serialize)]
pub struct PollOutcome {
    pub mode: IngestMode,
    pub devices: usize,
    pub report: IngestReport,
}

/// Drives one poll cycle at a time: registry lookup, acquisition, ingestion.
pub struct Poller<C: ReadingCollector> {
    collector: C,
    registry: Arc<DeviceRegistry>,
    manager: Arc<CacheManager>,
    config: PollerConfig,
    polls_ok: u64,
    polls_err: u64,
}

impl<C: ReadingCollector> Poller<C> {
    pub fn new(
        collector: C,
        registry: Arc<DeviceRegistry>,
        manager: Arc<CacheManager>,
        config: PollerConfig,
    ) -> Self {
        Self {
            collector,
            registry,
            manager,
            config,
            polls_ok: 0,
            polls_err: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.config.sample_interval
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn counters(&self) -> (u64, u64) {
        (self.polls_ok, self.polls_err)
    }

    pub async fn tick(&mut self) -> Result<PollOutcome, PollFailure> {
        let result = self.poll().await;
        match &result {
            Ok(_) => self.polls_ok += 1,
            Err(err) => {
                self.polls_err += 1;
                warn!(error = %err, "poll cycle failed");
            }
        }
        result
    }

    async fn poll(&mut self) -> Result<PollOutcome, PollFailure> {
        let devices = self.registry.enabled()?;

        self.manager
            .set_sampling_interval(self.config.sample_interval.as_secs().max(1))
            .await;

        match devices.as_slice() {
            [] => Err(RegistryError::NoEnabledDevices.into()),
            [device] => self.poll_single(device).await,
            _ => self.poll_multi(devices.clone()).await,
        }
    }

    async fn poll_single(&mut self, device: &DeviceConfig) -> Result<PollOutcome, PollFailure> {
        let reading = self.collector.collect(device).await;
        if reading.is_sentinel() {
            return Err(PollFailure::Unavailable {
                device: device.id.clone(),
                status: reading.status.clone(),
                reason: reading.error().unwrap_or_default().to_string(),
            });
        }

        let report = self.manager.add_single(self.manager.now(), reading).await?;
        Ok(PollOutcome {
            mode: IngestMode::Single,
            devices: 1,
            report,
        })
    }

    async fn poll_multi(&mut self, devices: Vec<DeviceConfig>) -> Result<PollOutcome, PollFailure> {
        debug!(devices = devices.len(), "multi-UPS poll");

        let mut readings = DeviceReadings::new();
        for device in &devices {
            let mut reading = self.collector.collect(device).await;
            reading.set("ups_id", FieldValue::Text(device.id.clone()));
            reading.set("ups_name", FieldValue::Text(device.name.clone()));
            reading.set("friendly_name", FieldValue::Text(device.display_name().to_string()));
            reading.set("is_primary", FieldValue::Flag(device.is_primary));
            readings.insert(device.id.clone(), reading);
        }

        let count = readings.len();
        let report = self.manager.add_multi(self.manager.now(), readings).await?;
        Ok(PollOutcome {
            mode: IngestMode::Multi,
            devices: count,
            report,
        })
    }
}
