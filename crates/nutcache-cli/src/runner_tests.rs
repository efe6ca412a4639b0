use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{TimeZone, Utc};
use nutcache_core::{FieldMap, JsonlRollupStore, Notification, View};

use crate::runner::RunState;

fn make_temp_dir(name: &str) -> PathBuf {
    let mut path = env::temp_dir();
    let uniq = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("unix epoch")
        .as_nanos();
    path.push(format!("nutcached-tests-{name}-{uniq}"));
    fs::create_dir_all(&path).expect("create temp dir");
    path
}

fn feb_15() -> SystemTime {
    Utc.with_ymd_and_hms(2026, 2, 15, 0, 0, 0)
        .single()
        .expect("valid date")
        .into()
}

#[test]
fn prune_runs_at_most_every_half_hour() {
    // Arrange
    let dir = make_temp_dir("prune-throttle");
    let old_file = dir.join("rollups-2025-11-16.jsonl");
    fs::write(&old_file, "old").expect("write old file");
    let store = Arc::new(JsonlRollupStore::open(&dir).expect("open store"));
    let mut state = RunState::new(store, 90);

    // Act
    let first = state.maybe_prune(feb_15());
    fs::write(&old_file, "old again").expect("rewrite old file");
    let throttled = state.maybe_prune(feb_15() + Duration::from_secs(60));
    let later = state.maybe_prune(feb_15() + Duration::from_secs(1800));

    // Assert
    assert_eq!(first, Some(1));
    assert_eq!(throttled, None);
    assert_eq!(later, Some(1));
    assert!(!old_file.exists());

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn latest_notification_is_mirrored_to_disk() {
    // Arrange
    let dir = make_temp_dir("latest");
    let store = Arc::new(JsonlRollupStore::open(&dir).expect("open store"));
    let state = RunState::new(store, 90);
    let mut fields = FieldMap::new();
    fields.insert("ups_status".into(), "OL".into());
    let ts = Utc
        .with_ymd_and_hms(2026, 3, 2, 12, 0, 0)
        .single()
        .expect("valid date");

    // Act
    state
        .write_latest(&Notification::CacheUpdate(View::new(ts, fields)))
        .expect("write latest");

    // Assert
    let raw = fs::read_to_string(dir.join("latest.json")).expect("read latest");
    let json: serde_json::Value = serde_json::from_str(&raw).expect("parse latest");
    assert_eq!(json["event"], "cache_update");
    assert_eq!(json["payload"]["ups_status"], "OL");

    let _ = fs::remove_dir_all(dir);
}
