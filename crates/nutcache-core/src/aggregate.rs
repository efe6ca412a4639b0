use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::reading::{
    FieldValue, Reading, BATTERY_CHARGE_KEY, BATTERY_RUNTIME_KEY, INPUT_VOLTAGE_KEY, LOAD_KEY,
    OUTPUT_VOLTAGE_KEY, REALPOWER_KEY,
};
use crate::reduce::round_to;
use crate::status::{is_online, worst, UNKNOWN_STATUS};

pub const AGGREGATE_SOURCE: &str = "multi_ups_aggregation";

/// Latest reading per device id, kept in the order devices were inserted.
/// Pollers insert in registry display order, which decides status ties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceReadings {
    entries: Vec<(String, Reading)>,
}

impl DeviceReadings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces an existing device's reading in place; new ids go last.
    pub fn insert(&mut self, id: String, reading: Reading) -> Option<Reading> {
        match self.entries.iter_mut().find(|(existing, _)| *existing == id) {
            Some((_, slot)) => Some(std::mem::replace(slot, reading)),
            None => {
                self.entries.push((id, reading));
                None
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Reading> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == id)
            .map(|(_, reading)| reading)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Reading)> {
        self.entries.iter().map(|(id, reading)| (id.as_str(), reading))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(id, _)| id.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Reading> {
        self.entries.iter().map(|(_, reading)| reading)
    }
}

impl IntoIterator for DeviceReadings {
    type Item = (String, Reading);
    type IntoIter = std::vec::IntoIter<(String, Reading)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<(String, Reading)> for DeviceReadings {
    fn from_iter<I: IntoIterator<Item = (String, Reading)>>(iter: I) -> Self {
        let mut readings = Self::new();
        for (id, reading) in iter {
            readings.insert(id, reading);
        }
        readings
    }
}

/// Synthetic reading combining every device at one sampling instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    #[serde(rename = "ups_status")]
    pub status: String,
    #[serde(rename = "ups_realpower")]
    pub realpower: f64,
    #[serde(rename = "ups_load")]
    pub load: f64,
    pub battery_charge: f64,
    pub battery_runtime: f64,
    pub input_voltage: f64,
    pub output_voltage: f64,
    #[serde(rename = "ups_count")]
    pub device_count: usize,
    #[serde(rename = "ups_online_count")]
    pub online_count: usize,
    #[serde(rename = "ups_offline_count")]
    pub offline_count: usize,
    pub is_aggregated: bool,
    pub source: String,
}

impl AggregateRecord {
    pub fn empty() -> Self {
        Self {
            status: UNKNOWN_STATUS.to_string(),
            realpower: 0.0,
            load: 0.0,
            battery_charge: 0.0,
            battery_runtime: 0.0,
            input_voltage: 0.0,
            output_voltage: 0.0,
            device_count: 0,
            online_count: 0,
            offline_count: 0,
            is_aggregated: true,
            source: AGGREGATE_SOURCE.to_string(),
        }
    }

    /// The aggregate as a reading, so it can be buffered and reduced like a
    /// sampled one.
    pub fn to_reading(&self) -> Reading {
        let mut reading = Reading::new(self.status.clone());
        reading.realpower = Some(FieldValue::Number(self.realpower));
        reading.load = Some(FieldValue::Number(self.load));
        reading.battery_charge = Some(FieldValue::Number(self.battery_charge));
        reading.battery_runtime = Some(FieldValue::Number(self.battery_runtime));
        reading.input_voltage = Some(FieldValue::Number(self.input_voltage));
        reading.output_voltage = Some(FieldValue::Number(self.output_voltage));
        reading.extra.insert("ups_count".into(), FieldValue::Number(self.device_count as f64));
        reading
            .extra
            .insert("ups_online_count".into(), FieldValue::Number(self.online_count as f64));
        reading
            .extra
            .insert("ups_offline_count".into(), FieldValue::Number(self.offline_count as f64));
        reading.extra.insert("is_aggregated".into(), FieldValue::Flag(self.is_aggregated));
        reading.extra.insert("source".into(), FieldValue::Text(self.source.clone()));
        reading
    }
}

/// Mean over strictly positive samples.
#[derive(Debug, Default)]
struct PositiveMean {
    sum: f64,
    count: usize,
}

impl PositiveMean {
    fn add(&mut self, value: f64) {
        if value > 0.0 {
            self.sum += value;
            self.count += 1;
        }
    }

    fn value(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

pub fn aggregate(readings: &DeviceReadings) -> AggregateRecord {
    if readings.is_empty() {
        debug!("no device readings to aggregate");
        return AggregateRecord::empty();
    }

    let mut total_power = 0.0;
    let mut load = PositiveMean::default();
    let mut charge = PositiveMean::default();
    let mut input_voltage = PositiveMean::default();
    let mut output_voltage = PositiveMean::default();
    let mut min_runtime: Option<f64> = None;
    let mut online = 0;

    for reading in readings.values() {
        if is_online(&reading.status) {
            online += 1;
        }

        total_power += reading.metric(REALPOWER_KEY);
        load.add(reading.metric(LOAD_KEY));
        charge.add(reading.metric(BATTERY_CHARGE_KEY));
        input_voltage.add(reading.metric(INPUT_VOLTAGE_KEY));
        output_voltage.add(reading.metric(OUTPUT_VOLTAGE_KEY));

        let runtime = reading.metric(BATTERY_RUNTIME_KEY);
        if runtime > 0.0 {
            min_runtime = Some(min_runtime.map_or(runtime, |current| current.min(runtime)));
        }
    }

    let device_count = readings.len();
    let record = AggregateRecord {
        status: worst(readings.values().map(|r| r.status.as_str())),
        realpower: round_to(total_power, 2),
        load: round_to(load.value(), 1),
        battery_charge: round_to(charge.value(), 1),
        battery_runtime: min_runtime.map(|r| round_to(r, 0)).unwrap_or(0.0),
        input_voltage: round_to(input_voltage.value(), 1),
        output_voltage: round_to(output_voltage.value(), 1),
        device_count,
        online_count: online,
        offline_count: device_count - online,
        is_aggregated: true,
        source: AGGREGATE_SOURCE.to_string(),
    };

    debug!(
        devices = device_count,
        status = %record.status,
        power = record.realpower,
        battery = record.battery_charge,
        online,
        "aggregated device readings"
    );

    record
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub ups_id: String,
    pub status: String,
    pub battery_charge: f64,
    pub realpower: f64,
    pub load: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateDetails {
    pub aggregated: AggregateRecord,
    pub devices: Vec<DeviceSummary>,
}

pub fn aggregate_with_details(readings: &DeviceReadings) -> AggregateDetails {
    let devices = readings
        .iter()
        .map(|(id, reading)| DeviceSummary {
            ups_id: id.to_string(),
            status: reading.status.clone(),
            battery_charge: reading.metric(BATTERY_CHARGE_KEY),
            realpower: reading.metric(REALPOWER_KEY),
            load: reading.metric(LOAD_KEY),
        })
        .collect();

    AggregateDetails {
        aggregated: aggregate(readings),
        devices,
    }
}
