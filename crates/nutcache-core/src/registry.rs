use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no enabled UPS devices configured")]
    NoEnabledDevices,
    #[error("missing UPS parameters for {id}: name={name:?}, host={host:?}")]
    MissingParameters {
        id: String,
        name: String,
        host: String,
    },
    #[error("invalid target {0:?}, expected name@host")]
    InvalidTarget(String),
    #[error("failed to read device list {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse device list {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to acquire lock on device registry")]
    Lock,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub friendly_name: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub order_index: i64,
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            host: host.into(),
            friendly_name: None,
            timeout_secs: default_timeout_secs(),
            is_primary: false,
            enabled: true,
            order_index: 0,
        }
    }

    /// Parses a `name@host` target; the host defaults to localhost.
    pub fn from_target(target: &str) -> Result<Self, RegistryError> {
        let target = target.trim();
        let (name, host) = match target.split_once('@') {
            Some((name, host)) => (name.trim(), host.trim()),
            None => (target, "localhost"),
        };
        if name.is_empty() || host.is_empty() {
            return Err(RegistryError::InvalidTarget(target.to_string()));
        }

        let mut config = Self::new(name, name, host);
        config.is_primary = true;
        Ok(config)
    }

    pub fn target(&self) -> String {
        format!("{}@{}", self.name, self.host)
    }

    pub fn display_name(&self) -> &str {
        self.friendly_name.as_deref().unwrap_or(&self.name)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() || self.host.trim().is_empty() {
            return Err(RegistryError::MissingParameters {
                id: self.id.clone(),
                name: self.name.clone(),
                host: self.host.clone(),
            });
        }
        Ok(())
    }
}

/// Where device configurations come from.
pub trait DeviceSource: Send + Sync {
    fn load(&self) -> Result<Vec<DeviceConfig>, RegistryError>;
}

/// JSON array of [`DeviceConfig`] on disk.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DeviceSource for JsonFileSource {
    fn load(&self) -> Result<Vec<DeviceConfig>, RegistryError> {
        let path = self.path.display().to_string();
        let raw = fs::read_to_string(&self.path).map_err(|source| RegistryError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| RegistryError::Parse { path, source })
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    devices: Vec<DeviceConfig>,
}

impl StaticSource {
    pub fn new(devices: Vec<DeviceConfig>) -> Self {
        Self { devices }
    }
}

impl DeviceSource for StaticSource {
    fn load(&self) -> Result<Vec<DeviceConfig>, RegistryError> {
        Ok(self.devices.clone())
    }
}

/// Device configurations, loaded once from their source and reused until
/// [`DeviceRegistry::reload`] is called.
pub struct DeviceRegistry {
    source: Box<dyn DeviceSource>,
    devices: RwLock<Option<Vec<DeviceConfig>>>,
}

impl DeviceRegistry {
    pub fn new(source: impl DeviceSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            devices: RwLock::new(None),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.devices.read().map(|d| d.is_some()).unwrap_or(false)
    }

    pub fn ensure_loaded(&self) -> Result<(), RegistryError> {
        if self.is_loaded() {
            return Ok(());
        }
        self.reload()
    }

    /// Re-reads the source. Devices with missing parameters are dropped with
    /// a warning; the previous list is kept if the source fails.
    pub fn reload(&self) -> Result<(), RegistryError> {
        let loaded = self.source.load()?;
        let mut devices: Vec<DeviceConfig> = loaded
            .into_iter()
            .filter(|device| match device.validate() {
                Ok(()) => true,
                Err(err) => {
                    warn!(error = %err, "ignoring misconfigured device");
                    false
                }
            })
            .collect();
        devices.sort_by(|a, b| a.order_index.cmp(&b.order_index).then_with(|| a.id.cmp(&b.id)));

        for device in &devices {
            debug!(id = %device.id, target = %device.target(), enabled = device.enabled, "loaded device");
        }
        info!(devices = devices.len(), "device registry loaded");

        let mut guard = self.devices.write().map_err(|_| RegistryError::Lock)?;
        *guard = Some(devices);
        Ok(())
    }

    fn with_devices<T>(&self, f: impl FnOnce(&[DeviceConfig]) -> T) -> Result<T, RegistryError> {
        self.ensure_loaded()?;
        let guard = self.devices.read().map_err(|_| RegistryError::Lock)?;
        Ok(f(guard.as_deref().unwrap_or(&[])))
    }

    /// Enabled devices in display order.
    pub fn enabled(&self) -> Result<Vec<DeviceConfig>, RegistryError> {
        let enabled = self.with_devices(|devices| {
            devices.iter().filter(|d| d.enabled).cloned().collect::<Vec<_>>()
        })?;
        if enabled.is_empty() {
            return Err(RegistryError::NoEnabledDevices);
        }
        Ok(enabled)
    }

    /// The device marked primary, else the first enabled one.
    pub fn primary(&self) -> Result<Option<DeviceConfig>, RegistryError> {
        self.with_devices(|devices| {
            devices
                .iter()
                .find(|d| d.enabled && d.is_primary)
                .or_else(|| devices.iter().find(|d| d.enabled))
                .cloned()
        })
    }

    pub fn by_id(&self, id: &str) -> Result<Option<DeviceConfig>, RegistryError> {
        self.with_devices(|devices| devices.iter().find(|d| d.id == id).cloned())
    }

    pub fn by_name(&self, name: &str) -> Result<Option<DeviceConfig>, RegistryError> {
        self.with_devices(|devices| devices.iter().find(|d| d.name == name).cloned())
    }
}
