use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::reading::{FieldMap, REALPOWER_KEY};

/// Durable unit of the rollup store: one boundary-aligned UTC timestamp and
/// whichever of the minute / hourly / daily values were produced for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<FieldMap>,
    #[serde(default, rename = "ups_realpower_hrs", skip_serializing_if = "Option::is_none")]
    pub hourly_power: Option<f64>,
    #[serde(default, rename = "ups_realpower_days", skip_serializing_if = "Option::is_none")]
    pub daily_power: Option<f64>,
}

impl RollupRecord {
    pub fn minute(timestamp: DateTime<Utc>, fields: FieldMap) -> Self {
        Self {
            timestamp,
            minute: Some(fields),
            hourly_power: None,
            daily_power: None,
        }
    }

    pub fn daily(timestamp: DateTime<Utc>, power: f64) -> Self {
        Self {
            timestamp,
            minute: None,
            hourly_power: None,
            daily_power: Some(power),
        }
    }

    /// Minute-average real power, when this record carries one.
    pub fn realpower(&self) -> Option<f64> {
        self.minute
            .as_ref()
            .and_then(|fields| fields.get(REALPOWER_KEY))
            .and_then(|value| value.as_f64())
    }
}
