//! Device status severity.
//!
//! NUT reports status as one or more space-separated codes (`"OL CHRG"`).
//! Severity is looked up exactly first; composite strings fall back to the
//! worst code found as a substring.

pub const UNKNOWN_STATUS: &str = "UNKNOWN";

/// Higher is worse.
const SEVERITY_TABLE: [(&str, u8); 9] = [
    ("OFFLINE", 8),
    ("OB DISCHRG", 7),
    ("OB", 6),
    ("LB", 5),
    ("RB", 4),
    ("OVER", 3),
    ("CHRG", 2),
    ("OL", 1),
    (UNKNOWN_STATUS, 0),
];

pub fn severity(status: &str) -> u8 {
    let normalized = status.trim().to_ascii_uppercase();
    if normalized.is_empty() {
        return 0;
    }

    if let Some((_, level)) = SEVERITY_TABLE.iter().find(|(code, _)| *code == normalized) {
        return *level;
    }

    SEVERITY_TABLE
        .iter()
        .filter(|(code, _)| normalized.contains(code))
        .map(|(_, level)| *level)
        .max()
        .unwrap_or(0)
}

/// Returns the status string with the highest severity, exactly as it was
/// reported. Ties keep the first one seen.
pub fn worst<I, S>(statuses: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut worst: Option<(String, u8)> = None;
    for status in statuses {
        let status = status.as_ref();
        let level = severity(status);
        match &worst {
            Some((_, current)) if level <= *current => {}
            _ => worst = Some((status.to_string(), level)),
        }
    }

    worst
        .map(|(status, _)| status)
        .unwrap_or_else(|| UNKNOWN_STATUS.to_string())
}

/// A device counts as online when its status mentions line power or charging.
pub fn is_online(status: &str) -> bool {
    let normalized = status.to_ascii_uppercase();
    normalized.contains("OL") || normalized.contains("CHRG")
}
