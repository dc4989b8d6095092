//! Time helpers used across the clustering core.
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the Unix epoch.
pub fn now_msec() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock is before the Unix epoch")
		.as_millis() as u64
}

/// Format a millisecond timestamp as a fixed-width, lexicographically
/// sortable key, used for transfer-record and lock keys.
pub fn msec_key(msec: u64) -> String {
	format!("{:020}", msec)
}
