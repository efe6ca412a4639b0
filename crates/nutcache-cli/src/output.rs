use anyhow::Result;
use nutcache_core::{MultiView, Notification, RollupRecord, View};

use crate::OutputFormat;

pub fn print_notification(notification: &Notification, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(notification)?),
        OutputFormat::Ndjson => println!("{}", serde_json::to_string(notification)?),
        OutputFormat::Human => println!("{}", render_notification(notification)),
    }
    Ok(())
}

pub fn print_rollups(records: &[RollupRecord], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(records)?),
        OutputFormat::Ndjson => {
            for record in records {
                println!("{}", serde_json::to_string(record)?);
            }
        }
        OutputFormat::Human => {
            for record in records {
                println!("{}", render_rollup(record));
            }
        }
    }
    Ok(())
}

pub fn render_notification(notification: &Notification) -> String {
    match notification {
        Notification::CacheUpdate(view) => [
            "=== UPS Update ===".to_string(),
            format!("Time:       {}", view.timestamp.to_rfc3339()),
            format!("Status:     {}", view.status().unwrap_or("n/a")),
            format!("Metrics:    {}", metrics_line(view)),
        ]
        .join("\n"),
        Notification::MultiUpsUpdate(multi) => render_multi(multi),
    }
}

fn render_multi(multi: &MultiView) -> String {
    let aggregated = &multi.aggregated;
    let mut lines = vec![
        format!("=== Multi-UPS Update ({} devices) ===", multi.ups_count),
        format!("Time:       {}", aggregated.timestamp.to_rfc3339()),
        format!(
            "Composite:  {} online={} offline={}",
            aggregated.status().unwrap_or("n/a"),
            number(aggregated, "ups_online_count", 0),
            number(aggregated, "ups_offline_count", 0),
        ),
        format!("Metrics:    {}", metrics_line(aggregated)),
    ];

    for (id, view) in &multi.individual {
        lines.push(format!(
            "  {id:<16} {:<12} {}",
            view.status().unwrap_or("n/a"),
            metrics_line(view)
        ));
    }

    lines.join("\n")
}

fn metrics_line(view: &View) -> String {
    format!(
        "power={}W load={}% charge={}% runtime={}s in={}V out={}V",
        number(view, "ups_realpower", 1),
        number(view, "ups_load", 1),
        number(view, "battery_charge", 1),
        number(view, "battery_runtime", 0),
        number(view, "input_voltage", 1),
        number(view, "output_voltage", 1),
    )
}

fn number(view: &View, key: &str, precision: usize) -> String {
    view.number(key)
        .map(|v| format!("{v:.precision$}"))
        .unwrap_or_else(|| "n/a".to_string())
}

pub fn render_rollup(record: &RollupRecord) -> String {
    let mut parts = vec![record.timestamp.to_rfc3339()];
    if let Some(power) = record.realpower() {
        parts.push(format!("minute={power:.2}W"));
    }
    if let Some(power) = record.hourly_power {
        parts.push(format!("hourly={power:.2}W"));
    }
    if let Some(power) = record.daily_power {
        parts.push(format!("daily={power:.2}W"));
    }
    parts.join("  ")
}
