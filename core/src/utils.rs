//! Small stateless helpers shared by the scheduler and the consumer pool.

use std::time::{SystemTime, UNIX_EPOCH};

/// BLAKE3 checksum of arbitrary bytes, hex-encoded. Used to fingerprint
/// config file contents for change detection.
pub fn calculate_string_checksum(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

/// Current Unix timestamp in whole seconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current Unix timestamp in milliseconds.
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Exponential backoff delay for the given attempt number, in milliseconds,
/// doubling from `base_delay_ms` and capped at `max_delay_ms`.
pub fn calculate_backoff_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let shift = attempt.min(10);
    let delay = base_delay_ms.saturating_mul(1u64 << shift);
    delay.min(max_delay_ms)
}
