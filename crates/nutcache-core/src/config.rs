use std::time::Duration;

use crate::reading::{BATTERY_CHARGE_KEY, INPUT_VOLTAGE_KEY, LOAD_KEY, REALPOWER_KEY};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Seconds of samples one buffer is sized to hold.
    pub cache_seconds: u64,
    pub min_capacity: usize,
    pub initial_capacity: usize,
    /// UTC hour at which the previous day's power is aggregated.
    pub daily_hour_utc: u32,
    /// Smallest move in a watched field that warrants a notification.
    pub change_threshold: f64,
    pub watched_fields: Vec<String>,
    pub notification_capacity: usize,
}

impl CacheConfig {
    /// Buffer capacity for a sampling interval: one cache window of samples,
    /// never below the minimum.
    pub fn capacity_for_interval(&self, interval_secs: u64) -> usize {
        if interval_secs == 0 {
            return self.initial_capacity.max(self.min_capacity);
        }
        ((self.cache_seconds / interval_secs) as usize).max(self.min_capacity)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_seconds: 60,
            min_capacity: 5,
            initial_capacity: 60,
            daily_hour_utc: 4,
            change_threshold: 1.0,
            watched_fields: [LOAD_KEY, BATTERY_CHARGE_KEY, REALPOWER_KEY, INPUT_VOLTAGE_KEY]
                .into_iter()
                .map(String::from)
                .collect(),
            notification_capacity: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub sample_interval: Duration,
    /// Nominal real power assumed when a device reports neither real power
    /// nor its nominal rating.
    pub default_nominal_power: f64,
    pub upsc_command: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            default_nominal_power: 1000.0,
            upsc_command: "upsc".to_string(),
        }
    }
}
