pub mod aggregate;
pub mod buffer;
pub mod clock;
pub mod collector;
pub mod config;
pub mod jsonl_store;
pub mod manager;
pub mod poller;
pub mod publisher;
pub mod reading;
pub mod reduce;
pub mod registry;
pub mod rollup;
pub mod scheduler;
pub mod status;
pub mod store;

#[cfg(test)]
mod manager_tests;
#[cfg(test)]
mod poller_tests;

pub use aggregate::{aggregate, aggregate_with_details, AggregateRecord, DeviceReadings};
pub use buffer::DeviceBuffer;
pub use clock::{Clock, ManualClock, SystemClock};
pub use collector::{CollectError, ReadingCollector, UpscCollector};
pub use config::{CacheConfig, PollerConfig};
pub use jsonl_store::JsonlRollupStore;
pub use manager::{CacheError, CacheManager, FlushOutcome, IngestMode, IngestReport};
pub use poller::{PollFailure, PollOutcome, Poller};
pub use publisher::{ChangeGate, MultiView, Notification, View};
pub use reading::{canonical_key, FieldMap, FieldValue, Reading};
pub use reduce::reduce;
pub use registry::{DeviceConfig, DeviceRegistry, DeviceSource, JsonFileSource, RegistryError, StaticSource};
pub use rollup::RollupRecord;
pub use scheduler::{RollupScheduler, SchedulerState};
pub use status::{severity, worst};
pub use store::{InMemoryRollupStore, RollupStore, StoreError};
