use std::collections::BTreeMap;

use crate::reading::{FieldMap, FieldValue, Reading};

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

#[derive(Debug)]
struct FieldAccumulator {
    sum: f64,
    count: usize,
    numeric: bool,
    last: FieldValue,
}

/// Reduces buffered readings to one record: uniformly numeric fields become
/// their mean (2 decimals), anything else keeps its most recent value.
///
/// A field missing from some readings is averaged over the readings that
/// carry it. Returns `None` for an empty buffer.
pub fn reduce<'a, I>(readings: I) -> Option<FieldMap>
where
    I: IntoIterator<Item = &'a Reading>,
{
    let mut fields: BTreeMap<String, FieldAccumulator> = BTreeMap::new();
    let mut seen = 0_usize;

    for reading in readings {
        seen += 1;
        for (key, value) in reading.to_fields() {
            let acc = fields.entry(key).or_insert_with(|| FieldAccumulator {
                sum: 0.0,
                count: 0,
                numeric: true,
                last: value.clone(),
            });
            match value.as_f64() {
                Some(v) => {
                    acc.sum += v;
                    acc.count += 1;
                }
                None => acc.numeric = false,
            }
            acc.last = value;
        }
    }

    if seen == 0 {
        return None;
    }

    let reduced = fields
        .into_iter()
        .map(|(key, acc)| {
            let value = if acc.numeric && acc.count > 0 {
                FieldValue::Number(round_to(acc.sum / acc.count as f64, 2))
            } else {
                acc.last
            };
            (key, value)
        })
        .collect();

    Some(reduced)
}
