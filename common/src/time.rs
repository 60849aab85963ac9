use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, used for session timestamps, heartbeat
/// freshness, and cooldown/timeout comparisons throughout the engine.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// `YYYY-MM` period key used by the per-period aggregator (spec §3, §4.F).
pub fn period_key(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y-%m").to_string()
}

/// `YYYY-H1`/`YYYY-H2` semester key used by the TPV-by-semester aggregator.
pub fn semester_key(ts: chrono::DateTime<chrono::Utc>) -> String {
    use chrono::Datelike;
    let half = if ts.month() <= 6 { "H1" } else { "H2" };
    format!("{}-{}", ts.year(), half)
}
