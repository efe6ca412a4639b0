use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::status::UNKNOWN_STATUS;

pub const STATUS_KEY: &str = "ups_status";
pub const REALPOWER_KEY: &str = "ups_realpower";
pub const REALPOWER_NOMINAL_KEY: &str = "ups_realpower_nominal";
pub const LOAD_KEY: &str = "ups_load";
pub const BATTERY_CHARGE_KEY: &str = "battery_charge";
pub const BATTERY_RUNTIME_KEY: &str = "battery_runtime";
pub const INPUT_VOLTAGE_KEY: &str = "input_voltage";
pub const OUTPUT_VOLTAGE_KEY: &str = "output_voltage";
pub const ERROR_KEY: &str = "error";

/// Field name to value, keyed by canonical (underscore) field names.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// A single reported value. Devices report numbers and free text; flags
/// only appear in metadata attached by the poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Flag(bool),
    Text(String),
}

impl FieldValue {
    /// Parses raw agent output: anything that reads as a float becomes a number.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<f64>() {
            Ok(v) if v.is_finite() => FieldValue::Number(v),
            _ => FieldValue::Text(trimmed.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric value with text parsed leniently; anything else is 0.0.
    pub fn coerce_f64(&self) -> f64 {
        match self {
            FieldValue::Number(v) => *v,
            FieldValue::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(0.0),
            FieldValue::Flag(_) => 0.0,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Flag(value)
    }
}

/// Canonical form of a field name: dots and underscores are the same
/// separator, underscores win.
pub fn canonical_key(key: &str) -> String {
    key.trim().replace('.', "_")
}

/// One device sample. The metrics this crate reasons about are typed fields;
/// everything else a vendor reports is kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "FieldMap")]
pub struct Reading {
    #[serde(rename = "ups_status")]
    pub status: String,
    #[serde(rename = "ups_realpower", skip_serializing_if = "Option::is_none")]
    pub realpower: Option<FieldValue>,
    #[serde(rename = "ups_load", skip_serializing_if = "Option::is_none")]
    pub load: Option<FieldValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_charge: Option<FieldValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_runtime: Option<FieldValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_voltage: Option<FieldValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_voltage: Option<FieldValue>,
    #[serde(flatten)]
    pub extra: FieldMap,
}

impl Default for Reading {
    fn default() -> Self {
        Self::new(UNKNOWN_STATUS)
    }
}

impl Reading {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            realpower: None,
            load: None,
            battery_charge: None,
            battery_runtime: None,
            input_voltage: None,
            output_voltage: None,
            extra: BTreeMap::new(),
        }
    }

    /// Builds a reading from loosely named fields, normalizing every key.
    pub fn from_fields<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<FieldValue>,
    {
        let mut reading = Self::default();
        for (key, value) in fields {
            reading.set(key.as_ref(), value.into());
        }
        reading
    }

    /// Reading reported when a device could not be read. Battery and voltage
    /// fields are zeroed so downstream merges always see a well-formed input.
    pub fn sentinel(status: &str, error: impl Into<String>) -> Self {
        let mut reading = Self::new(status);
        reading.battery_charge = Some(FieldValue::Number(0.0));
        reading.battery_runtime = Some(FieldValue::Number(0.0));
        reading.input_voltage = Some(FieldValue::Number(0.0));
        reading.output_voltage = Some(FieldValue::Number(0.0));
        reading.extra.insert(ERROR_KEY.to_string(), FieldValue::Text(error.into()));
        reading
    }

    pub fn is_sentinel(&self) -> bool {
        self.extra.contains_key(ERROR_KEY)
    }

    pub fn error(&self) -> Option<&str> {
        self.extra.get(ERROR_KEY).and_then(FieldValue::as_str)
    }

    pub fn set(&mut self, key: &str, value: FieldValue) {
        let key = canonical_key(key);
        match key.as_str() {
            STATUS_KEY | "status" => {
                self.status = match value {
                    FieldValue::Text(s) => s,
                    FieldValue::Number(n) => n.to_string(),
                    FieldValue::Flag(b) => b.to_string(),
                }
            }
            _ => {
                if let Some(slot) = self.slot_mut(&key) {
                    *slot = Some(value);
                } else {
                    self.extra.insert(key, value);
                }
            }
        }
    }

    /// Looks a field up by any spelling of its name.
    pub fn get(&self, key: &str) -> Option<FieldValue> {
        let key = canonical_key(key);
        match key.as_str() {
            STATUS_KEY | "status" => Some(FieldValue::Text(self.status.clone())),
            _ => match self.slot(&key) {
                Some(slot) => slot.clone(),
                None => self.extra.get(&key).cloned(),
            },
        }
    }

    /// Numeric value of a field, 0.0 when absent or unparseable.
    pub fn metric(&self, key: &str) -> f64 {
        self.get(key).map(|v| v.coerce_f64()).unwrap_or(0.0)
    }

    /// Flat canonical view of every field, status included.
    pub fn to_fields(&self) -> FieldMap {
        let mut fields = self.extra.clone();
        fields.insert(STATUS_KEY.to_string(), FieldValue::Text(self.status.clone()));
        for (key, slot) in self.named_slots() {
            if let Some(value) = slot {
                fields.insert(key.to_string(), value.clone());
            }
        }
        fields
    }

    /// Fills in `ups_realpower` from nominal power and load when the device
    /// does not report it (or reports zero).
    pub fn derive_realpower(&mut self, default_nominal: f64) {
        let current = self.realpower.as_ref().map(FieldValue::coerce_f64).unwrap_or(0.0);
        if current != 0.0 {
            return;
        }

        let load = self.metric(LOAD_KEY);
        let nominal = self
            .extra
            .get(REALPOWER_NOMINAL_KEY)
            .map(FieldValue::coerce_f64)
            .unwrap_or(default_nominal);

        if load > 0.0 && nominal > 0.0 {
            let power = crate::reduce::round_to(nominal * load / 100.0, 2);
            self.realpower = Some(FieldValue::Number(power));
        } else {
            tracing::debug!(load, nominal, "cannot derive real power");
        }
    }

    fn named_slots(&self) -> [(&'static str, &Option<FieldValue>); 6] {
        [
            (REALPOWER_KEY, &self.realpower),
            (LOAD_KEY, &self.load),
            (BATTERY_CHARGE_KEY, &self.battery_charge),
            (BATTERY_RUNTIME_KEY, &self.battery_runtime),
            (INPUT_VOLTAGE_KEY, &self.input_voltage),
            (OUTPUT_VOLTAGE_KEY, &self.output_voltage),
        ]
    }

    fn slot(&self, key: &str) -> Option<&Option<FieldValue>> {
        self.named_slots()
            .into_iter()
            .find(|(name, _)| *name == key || short_alias(name) == Some(key))
            .map(|(_, slot)| slot)
    }

    fn slot_mut(&mut self, key: &str) -> Option<&mut Option<FieldValue>> {
        match key {
            REALPOWER_KEY | "realpower" => Some(&mut self.realpower),
            LOAD_KEY | "load" => Some(&mut self.load),
            BATTERY_CHARGE_KEY => Some(&mut self.battery_charge),
            BATTERY_RUNTIME_KEY => Some(&mut self.battery_runtime),
            INPUT_VOLTAGE_KEY => Some(&mut self.input_voltage),
            OUTPUT_VOLTAGE_KEY => Some(&mut self.output_voltage),
            _ => None,
        }
    }
}

fn short_alias(key: &str) -> Option<&'static str> {
    match key {
        REALPOWER_KEY => Some("realpower"),
        LOAD_KEY => Some("load"),
        _ => None,
    }
}

impl From<FieldMap> for Reading {
    fn from(fields: FieldMap) -> Self {
        Reading::from_fields(fields)
    }
}
