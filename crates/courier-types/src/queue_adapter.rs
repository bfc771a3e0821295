//! Queue adapter. Persists email delivery jobs for the worker.
//!
//! Ordering of due items (priority, backoff) and exclusive claiming are the
//! adapter's responsibility; the worker trusts whatever the fetch methods return.

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

use crate::email::{EmailQueueItem, EnqueueInput};
use crate::prelude::*;

#[async_trait]
pub trait QueueAdapter: Debug + Send + Sync {
	/// Persist a new pending item
	async fn enqueue(&self, input: EnqueueInput) -> ClResult<EmailQueueItem>;

	/// Fetch up to `limit` never-attempted items
	async fn get_next_to_process(&self, limit: u32) -> ClResult<Vec<EmailQueueItem>>;

	/// Fetch up to `limit` failed items whose backoff window has elapsed
	async fn get_retryable_emails(&self, limit: u32) -> ClResult<Vec<EmailQueueItem>>;

	async fn mark_as_sent(&self, id: ItemId) -> ClResult<()>;

	/// Record a failed attempt. With `should_retry` the item becomes retry-pending,
	/// otherwise it is terminally failed.
	async fn mark_as_failed(&self, id: ItemId, error: &str, should_retry: bool) -> ClResult<()>;

	/// Delete every item created more than `older_than` ago, regardless of status.
	/// Returns the number of deleted items.
	async fn cleanup_old_emails(&self, older_than: Duration) -> ClResult<u64>;

	/// Read a single item
	async fn read_email(&self, id: ItemId) -> ClResult<EmailQueueItem>;
}

/// Exponential backoff between delivery attempts, in seconds
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	wait_min_max: (u64, u64),
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self { wait_min_max: (60, 3600) }
	}
}

impl RetryPolicy {
	/// Create a new RetryPolicy with custom min/max backoff
	pub fn new(wait_min_max: (u64, u64)) -> Self {
		Self { wait_min_max }
	}

	/// Backoff before the next attempt, given how many attempts already failed
	pub fn calculate_backoff(&self, attempt_count: u32) -> u64 {
		let (min, max) = self.wait_min_max;
		let factor = 1u64.checked_shl(attempt_count).unwrap_or(u64::MAX);
		min.saturating_mul(factor).min(max)
	}
}


// vim: ts=4
