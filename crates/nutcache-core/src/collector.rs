use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::reading::{FieldValue, Reading};
use crate::registry::DeviceConfig;

pub const STATUS_ERROR: &str = "ERROR";
pub const STATUS_TIMEOUT: &str = "TIMEOUT";
pub const STATUS_NO_DATA: &str = "NO_DATA";

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("UPS command timed out for {0}")]
    Timeout(String),
    #[error("UPS command failed for {target}: {stderr}")]
    CommandFailed { target: String, stderr: String },
    #[error("no data returned from UPS {0}")]
    NoData(String),
    #[error("failed to run UPS command: {0}")]
    Spawn(String),
}

impl CollectError {
    pub fn sentinel_status(&self) -> &'static str {
        match self {
            CollectError::Timeout(_) => STATUS_TIMEOUT,
            CollectError::NoData(_) => STATUS_NO_DATA,
            CollectError::CommandFailed { .. } | CollectError::Spawn(_) => STATUS_ERROR,
        }
    }

    /// The reading handed downstream in place of a real sample.
    pub fn into_reading(self) -> Reading {
        Reading::sentinel(self.sentinel_status(), self.to_string())
    }
}

/// Reads one device. Never fails: acquisition problems come back as a
/// sentinel [`Reading`].
#[async_trait]
pub trait ReadingCollector: Send + Sync {
    async fn collect(&self, device: &DeviceConfig) -> Reading;
}

/// Splits `key: value` lines at the first colon.
pub fn parse_upsc_output(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Typed reading from raw agent variables, with real power derived when the
/// device does not report it.
pub fn reading_from_vars(vars: &BTreeMap<String, String>, default_nominal: f64) -> Reading {
    let mut reading = Reading::from_fields(vars.iter().map(|(k, v)| (k.as_str(), FieldValue::parse(v))));
    reading.derive_realpower(default_nominal);
    reading
}

/// Runs NUT's `upsc <name>@<host>` per read.
#[derive(Debug, Clone)]
pub struct UpscCollector {
    command: String,
    default_nominal: f64,
}

impl UpscCollector {
    pub fn new(command: impl Into<String>, default_nominal: f64) -> Self {
        Self {
            command: command.into(),
            default_nominal,
        }
    }

    async fn run(&self, device: &DeviceConfig) -> Result<BTreeMap<String, String>, CollectError> {
        let target = device.target();
        debug!(command = %self.command, %target, "polling UPS");

        let mut command = Command::new(&self.command);
        command.arg(&target).stdin(Stdio::null()).kill_on_drop(true);

        let output = timeout(device.timeout(), command.output())
            .await
            .map_err(|_| CollectError::Timeout(device.name.clone()))?
            .map_err(|err| CollectError::Spawn(err.to_string()))?;

        if !output.status.success() {
            return Err(CollectError::CommandFailed {
                target,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let vars = parse_upsc_output(&String::from_utf8_lossy(&output.stdout));
        if vars.is_empty() {
            return Err(CollectError::NoData(device.name.clone()));
        }
        Ok(vars)
    }
}

#[async_trait]
impl ReadingCollector for UpscCollector {
    async fn collect(&self, device: &DeviceConfig) -> Reading {
        match self.run(device).await {
            Ok(vars) => {
                let reading = reading_from_vars(&vars, self.default_nominal);
                debug!(
                    device = %device.id,
                    status = %reading.status,
                    fields = vars.len(),
                    "retrieved UPS data"
                );
                reading
            }
            Err(err) => {
                warn!(device = %device.id, error = %err, "UPS acquisition failed");
                err.into_reading()
            }
        }
    }
}
