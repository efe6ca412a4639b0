use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use nutcache_core::{
    CacheConfig, CacheManager, DeviceConfig, DeviceRegistry, IngestMode, InMemoryRollupStore,
    JsonFileSource, JsonlRollupStore, Notification, Poller, PollerConfig, RollupStore, StaticSource,
    SystemClock, UpscCollector,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod output;
mod runner;
mod viewer;
#[cfg(test)]
mod runner_tests;

#[derive(Debug, Parser)]
#[command(name = "nutcached")]
#[command(about = "NUT UPS rollup cache (minute/hour/day power rollups)")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON device list; overrides --ups.
    #[arg(long)]
    devices: Option<String>,

    #[arg(long, default_value = "ups@localhost")]
    ups: String,

    #[arg(long, default_value = "upsc")]
    upsc: String,

    #[arg(long, default_value_t = 1)]
    interval_secs: u64,

    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    #[arg(long, default_value_t = 1000.0)]
    nominal_power: f64,

    #[arg(long, default_value_t = 1.0)]
    change_threshold: f64,

    #[arg(long, default_value_t = 4)]
    daily_hour: u32,
}

#[derive(Debug, Subcommand)]
enum Command {
    Devices,
    Once {
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,
    },
    Run {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
        #[arg(long, default_value = "./data/rollups")]
        output_dir: String,
        #[arg(long, default_value_t = 90)]
        retention_days: u64,
    },
    View {
        #[arg(long, default_value_t = 180.0)]
        window_sec: f64,
    },
    Rollups {
        #[arg(long, default_value = "./data/rollups")]
        output_dir: String,
        /// Range start (RFC 3339), defaults to one day before --to.
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        #[arg(long, value_enum, default_value = "ndjson")]
        format: OutputFormat,
    },
    Prune {
        #[arg(long, default_value = "./data/rollups")]
        output_dir: String,
        #[arg(long, default_value_t = 90)]
        retention_days: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Ndjson,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Devices => {
            let registry = build_registry(&cli)?;
            let devices = registry.enabled()?;
            println!("{}", serde_json::to_string_pretty(&devices)?);
        }
        Command::Once { format } => {
            let mut poller = build_poller(&cli, Arc::new(InMemoryRollupStore::new()))?;
            let outcome = poller.tick().await?;
            let notification = latest_notification(poller.manager(), outcome.mode)
                .await
                .context("no view was published")?;
            output::print_notification(&notification, *format)?;
        }
        Command::Run {
            format,
            output_dir,
            retention_days,
        } => {
            let store = Arc::new(JsonlRollupStore::open(output_dir)?);
            let mut poller = build_poller(&cli, store.clone())?;
            runner::run_daemon(&mut poller, store, *format, *retention_days).await?;
        }
        Command::View { window_sec } => {
            let mut poller = build_poller(&cli, Arc::new(InMemoryRollupStore::new()))?;
            viewer::run_viewer(&mut poller, *window_sec).await?;
        }
        Command::Rollups {
            output_dir,
            from,
            to,
            format,
        } => {
            let store = JsonlRollupStore::open(output_dir)?;
            let to = to.unwrap_or_else(Utc::now);
            let from = from.unwrap_or(to - chrono::Duration::days(1));
            let records = store.query(from, to).await?;
            output::print_rollups(&records, *format)?;
        }
        Command::Prune {
            output_dir,
            retention_days,
        } => {
            let store = JsonlRollupStore::open(output_dir)?;
            let removed = store.prune(*retention_days, SystemTime::now())?;
            info!(removed, dir = %store.dir().display(), "pruned rollup files");
            println!("{}", serde_json::json!({ "removed": removed }));
        }
    }

    Ok(())
}

fn build_registry(cli: &Cli) -> Result<DeviceRegistry> {
    let registry = match &cli.devices {
        Some(path) => DeviceRegistry::new(JsonFileSource::new(path)),
        None => {
            let mut device = DeviceConfig::from_target(&cli.ups)?;
            device.timeout_secs = cli.timeout_secs;
            DeviceRegistry::new(StaticSource::new(vec![device]))
        }
    };
    Ok(registry)
}

fn build_poller(cli: &Cli, store: Arc<dyn RollupStore>) -> Result<Poller<UpscCollector>> {
    let registry = Arc::new(build_registry(cli)?);

    let cache_config = CacheConfig {
        change_threshold: cli.change_threshold,
        daily_hour_utc: cli.daily_hour,
        ..CacheConfig::default()
    };
    let manager = Arc::new(CacheManager::new(cache_config, store, Arc::new(SystemClock)));

    let config = PollerConfig {
        sample_interval: Duration::from_secs(cli.interval_secs.max(1)),
        default_nominal_power: cli.nominal_power,
        upsc_command: cli.upsc.clone(),
    };
    let collector = UpscCollector::new(config.upsc_command.clone(), config.default_nominal_power);

    Ok(Poller::new(collector, registry, manager, config))
}

async fn latest_notification(manager: &CacheManager, mode: IngestMode) -> Option<Notification> {
    match mode {
        IngestMode::Single => manager.latest_view().await.map(Notification::CacheUpdate),
        IngestMode::Multi => manager
            .latest_multi_view()
            .await
            .map(Notification::MultiUpsUpdate),
    }
}
