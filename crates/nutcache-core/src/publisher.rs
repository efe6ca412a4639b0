//! Change-gated notifications.
//!
//! Every ingestion offers a view to the [`Publisher`]; observers only hear
//! about it when the status changed or a watched metric moved by at least
//! the configured threshold.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::reading::{FieldMap, FieldValue, STATUS_KEY};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: FieldMap,
}

impl View {
    pub fn new(timestamp: DateTime<Utc>, fields: FieldMap) -> Self {
        Self { timestamp, fields }
    }

    pub fn status(&self) -> Option<&str> {
        self.fields.get(STATUS_KEY).and_then(FieldValue::as_str)
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(FieldValue::as_f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiView {
    pub aggregated: View,
    pub individual: BTreeMap<String, View>,
    pub ups_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum Notification {
    CacheUpdate(View),
    MultiUpsUpdate(MultiView),
}

#[derive(Debug, Clone)]
pub struct ChangeGate {
    threshold: f64,
    watched: Vec<String>,
}

impl ChangeGate {
    pub fn new(threshold: f64, watched: Vec<String>) -> Self {
        Self { threshold, watched }
    }

    pub fn is_significant(&self, previous: Option<&FieldMap>, next: &FieldMap) -> bool {
        let Some(previous) = previous else {
            return true;
        };

        if previous.get(STATUS_KEY) != next.get(STATUS_KEY) {
            return true;
        }

        self.watched.iter().any(|field| {
            match (previous.get(field), next.get(field)) {
                (None, None) => false,
                (Some(FieldValue::Number(before)), Some(FieldValue::Number(after))) => {
                    (after - before).abs() >= self.threshold
                }
                // A numeric value on one side only cannot be compared.
                (Some(FieldValue::Number(_)), _) | (_, Some(FieldValue::Number(_))) => true,
                (before, after) => before != after,
            }
        })
    }
}

pub struct Publisher {
    gate: ChangeGate,
    tx: broadcast::Sender<Notification>,
    last_single: Option<View>,
    last_aggregated: Option<View>,
    last_individual: BTreeMap<String, View>,
}

impl Publisher {
    pub fn new(gate: ChangeGate, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            gate,
            tx,
            last_single: None,
            last_aggregated: None,
            last_individual: BTreeMap::new(),
        }
    }

    pub fn sender(&self) -> broadcast::Sender<Notification> {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Single-device mode. Returns whether observers were notified.
    pub fn publish_single(&mut self, view: View) -> bool {
        if view.fields.is_empty() {
            return false;
        }

        let previous = self.last_single.as_ref().map(|v| &v.fields);
        if !self.gate.is_significant(previous, &view.fields) {
            debug!("skipping cache update, no significant change");
            return false;
        }

        self.last_single = Some(view.clone());
        self.send(Notification::CacheUpdate(view));
        true
    }

    /// Multi-device mode: notifies when the aggregate or any device view
    /// changed, or when devices came or went.
    pub fn publish_multi(&mut self, aggregated: View, individual: BTreeMap<String, View>) -> bool {
        let aggregate_changed = self
            .gate
            .is_significant(self.last_aggregated.as_ref().map(|v| &v.fields), &aggregated.fields);

        let membership_changed = individual.len() != self.last_individual.len()
            || individual.keys().any(|id| !self.last_individual.contains_key(id));

        let device_changed = membership_changed
            || individual.iter().any(|(id, view)| {
                self.gate
                    .is_significant(self.last_individual.get(id).map(|v| &v.fields), &view.fields)
            });

        if !aggregate_changed && !device_changed {
            debug!("skipping multi-device update, no significant change");
            return false;
        }

        let ups_count = individual.len();
        debug!(
            devices = ups_count,
            status = aggregated.status().unwrap_or("UNKNOWN"),
            "broadcasting multi-device update"
        );

        self.last_aggregated = Some(aggregated.clone());
        self.last_individual = individual.clone();
        self.send(Notification::MultiUpsUpdate(MultiView {
            aggregated,
            individual,
            ups_count,
        }));
        true
    }

    fn send(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            debug!("no observers subscribed");
        }
    }

    /// Last view sent in single-device mode.
    pub fn latest_view(&self) -> Option<View> {
        self.last_single.clone()
    }

    pub fn latest_multi_view(&self) -> Option<MultiView> {
        self.last_aggregated.as_ref().map(|aggregated| MultiView {
            aggregated: aggregated.clone(),
            individual: self.last_individual.clone(),
            ups_count: self.last_individual.len(),
        })
    }
}
