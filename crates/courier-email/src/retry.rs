//! Retry classification for failed deliveries
//!
//! Classification looks at the error text only. Markers for permanent failures are
//! checked before markers for transient ones, and anything unrecognised is retried.

use crate::prelude::*;

/// Error text fragments that indicate a failure retrying cannot fix
const NON_RETRYABLE_MARKERS: &[&str] = &["template", "parse", "validation"];

/// Error text fragments that indicate a transient transport failure
const RETRYABLE_MARKERS: &[&str] = &["timeout", "timed out", "connection", "refused"];

/// Whether an error looks transient
pub fn classify_retryable(err: &Error) -> bool {
	let text = err.to_string().to_lowercase();

	if NON_RETRYABLE_MARKERS.iter().any(|m| text.contains(m)) {
		return false;
	}
	if RETRYABLE_MARKERS.iter().any(|m| text.contains(m)) {
		return true;
	}
	true
}

/// Retry decision for an item that has already failed `retry_count` times
pub fn should_retry(err: &Error, retry_count: u32, max_retries: u32) -> bool {
	retry_count < max_retries && classify_retryable(err)
}


// vim: ts=4
