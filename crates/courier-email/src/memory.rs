//! In-memory queue adapter
//!
//! Keeps the queue in a `BTreeMap` behind a mutex. Used by tests and by
//! deployments that accept losing queued emails on restart. Claiming works like
//! the SQLite adapter: fetched items get a lease and are hidden from further
//! fetches until they are marked or the lease runs out.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use courier_types::email::{EmailQueueItem, EnqueueInput, QueueStatus};
use courier_types::queue_adapter::{QueueAdapter, RetryPolicy};

use crate::prelude::*;

/// Seconds a fetched item stays claimed
pub const DEFAULT_LEASE_SECS: u64 = 600;

#[derive(Debug, Default)]
struct State {
	items: BTreeMap<ItemId, EmailQueueItem>,
	leases: HashMap<ItemId, Timestamp>,
	last_id: ItemId,
}

impl State {
	fn is_leased(&self, id: ItemId, now: Timestamp) -> bool {
		self.leases.get(&id).is_some_and(|until| *until > now)
	}

	/// Lease and return the best `limit` items matching `due`
	fn claim(
		&mut self,
		limit: u32,
		now: Timestamp,
		lease_secs: u64,
		due: impl Fn(&EmailQueueItem) -> bool,
	) -> Vec<EmailQueueItem> {
		let mut candidates: Vec<&EmailQueueItem> = self
			.items
			.values()
			.filter(|item| due(item) && !self.is_leased(item.id, now))
			.collect();
		candidates.sort_by_key(|item| (-item.priority.weight(), item.created_at, item.id));

		let claimed: Vec<EmailQueueItem> = candidates
			.into_iter()
			.take(usize::try_from(limit).unwrap_or(usize::MAX))
			.cloned()
			.collect();

		let until = now.add_seconds(lease_secs);
		for item in &claimed {
			self.leases.insert(item.id, until);
		}
		claimed
	}

	fn get_open_mut(&mut self, id: ItemId) -> ClResult<&mut EmailQueueItem> {
		let item = self.items.get_mut(&id).ok_or(Error::NotFound)?;
		if item.status.is_terminal() {
			return Err(Error::Conflict(format!("email #{} is already {}", id, item.status)));
		}
		Ok(item)
	}
}

#[derive(Debug)]
pub struct InMemoryQueueAdapter {
	state: Mutex<State>,
	retry_policy: RetryPolicy,
	lease_secs: u64,
}

impl InMemoryQueueAdapter {
	pub fn new() -> Arc<Self> {
		Self::with_policy(RetryPolicy::default(), DEFAULT_LEASE_SECS)
	}

	pub fn with_policy(retry_policy: RetryPolicy, lease_secs: u64) -> Arc<Self> {
		Arc::new(Self { state: Mutex::new(State::default()), retry_policy, lease_secs })
	}

	/// Insert an item as-is, keeping its id and timestamps
	pub fn restore(&self, item: EmailQueueItem) {
		let mut state = self.state.lock();
		state.last_id = state.last_id.max(item.id);
		state.items.insert(item.id, item);
	}

	pub fn len(&self) -> usize {
		self.state.lock().items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.state.lock().items.is_empty()
	}
}

#[async_trait]
impl QueueAdapter for InMemoryQueueAdapter {
	async fn enqueue(&self, input: EnqueueInput) -> ClResult<EmailQueueItem> {
		let mut state = self.state.lock();
		state.last_id += 1;
		let item = EmailQueueItem::from_input(state.last_id, input, Timestamp::now());
		state.items.insert(item.id, item.clone());
		Ok(item)
	}

	async fn get_next_to_process(&self, limit: u32) -> ClResult<Vec<EmailQueueItem>> {
		let now = Timestamp::now();
		let mut state = self.state.lock();
		Ok(state.claim(limit, now, self.lease_secs, |item| item.status == QueueStatus::Pending))
	}

	async fn get_retryable_emails(&self, limit: u32) -> ClResult<Vec<EmailQueueItem>> {
		let now = Timestamp::now();
		let mut state = self.state.lock();
		Ok(state.claim(limit, now, self.lease_secs, |item| {
			item.status == QueueStatus::RetryPending
				&& item.next_retry_at.is_none_or(|at| at <= now)
		}))
	}

	async fn mark_as_sent(&self, id: ItemId) -> ClResult<()> {
		let mut state = self.state.lock();
		state.get_open_mut(id)?.apply_sent(Timestamp::now());
		state.leases.remove(&id);
		Ok(())
	}

	async fn mark_as_failed(&self, id: ItemId, error: &str, should_retry: bool) -> ClResult<()> {
		let now = Timestamp::now();
		let mut state = self.state.lock();
		let item = state.get_open_mut(id)?;
		let backoff = self.retry_policy.calculate_backoff(item.retry_count);
		item.apply_failure(error, should_retry, now.add_seconds(backoff), now);
		state.leases.remove(&id);
		Ok(())
	}

	async fn cleanup_old_emails(&self, older_than: Duration) -> ClResult<u64> {
		let cutoff = Timestamp::ago(older_than);
		let mut state = self.state.lock();
		let before = state.items.len();
		state.items.retain(|_, item| item.created_at >= cutoff);
		let State { items, leases, .. } = &mut *state;
		leases.retain(|id, _| items.contains_key(id));
		Ok(u64::try_from(before - state.items.len()).unwrap_or(u64::MAX))
	}

	async fn read_email(&self, id: ItemId) -> ClResult<EmailQueueItem> {
		self.state.lock().items.get(&id).cloned().ok_or(Error::NotFound)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use courier_types::email::Priority;

	fn input(template: &str, priority: Priority) -> EnqueueInput {
		EnqueueInput {
			to: vec!["user@example.com".into()],
			cc: vec![],
			bcc: vec![],
			subject: String::new(),
			template: template.into(),
			locale: String::new(),
			data: "{}".into(),
			headers: None,
			priority,
			max_retries: 3,
			reference: None,
			created_by: None,
		}
	}

	#[tokio::test]
	async fn test_high_priority_first() {
		let adapter = InMemoryQueueAdapter::new();
		adapter.enqueue(input("signature_reminder", Priority::Normal)).await.unwrap();
		adapter.enqueue(input("magic_link", Priority::High)).await.unwrap();
		adapter.enqueue(input("other", Priority::Normal)).await.unwrap();

		let items = adapter.get_next_to_process(10).await.unwrap();
		let ids: Vec<ItemId> = items.iter().map(|i| i.id).collect();
		assert_eq!(ids, vec![2, 1, 3]);
	}

	#[tokio::test]
	async fn test_claimed_items_are_not_fetched_twice() {
		let adapter = InMemoryQueueAdapter::new();
		for _ in 0..3 {
			adapter.enqueue(input("signature_reminder", Priority::Normal)).await.unwrap();
		}

		assert_eq!(adapter.get_next_to_process(2).await.unwrap().len(), 2);
		let rest = adapter.get_next_to_process(10).await.unwrap();
		assert_eq!(rest.len(), 1);
		assert_eq!(rest[0].id, 3);
		assert!(adapter.get_next_to_process(10).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_expired_lease_is_reclaimed() {
		let adapter = InMemoryQueueAdapter::with_policy(RetryPolicy::default(), 0);
		adapter.enqueue(input("signature_reminder", Priority::Normal)).await.unwrap();

		assert_eq!(adapter.get_next_to_process(10).await.unwrap().len(), 1);
		assert_eq!(adapter.get_next_to_process(10).await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_retry_waits_for_backoff() {
		let adapter = InMemoryQueueAdapter::new();
		let item = adapter.enqueue(input("signature_reminder", Priority::Normal)).await.unwrap();
		adapter.get_next_to_process(10).await.unwrap();

		adapter.mark_as_failed(item.id, "connection refused", true).await.unwrap();
		let stored = adapter.read_email(item.id).await.unwrap();
		assert_eq!(stored.status, QueueStatus::RetryPending);
		assert_eq!(stored.retry_count, 1);
		assert!(stored.next_retry_at.is_some_and(|at| at > Timestamp::now()));

		// Default policy waits at least a minute
		assert!(adapter.get_retryable_emails(10).await.unwrap().is_empty());
		assert!(adapter.get_next_to_process(10).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_retry_due_without_backoff() {
		let adapter =
			InMemoryQueueAdapter::with_policy(RetryPolicy::new((0, 0)), DEFAULT_LEASE_SECS);
		let item = adapter.enqueue(input("signature_reminder", Priority::Normal)).await.unwrap();
		adapter.get_next_to_process(10).await.unwrap();
		adapter.mark_as_failed(item.id, "timeout", true).await.unwrap();

		let retry = adapter.get_retryable_emails(10).await.unwrap();
		assert_eq!(retry.len(), 1);
		assert_eq!(retry[0].id, item.id);
	}

	#[tokio::test]
	async fn test_terminal_states_are_absorbing() {
		let adapter = InMemoryQueueAdapter::new();
		let item = adapter.enqueue(input("signature_reminder", Priority::Normal)).await.unwrap();
		adapter.mark_as_sent(item.id).await.unwrap();

		let res = adapter.mark_as_failed(item.id, "late failure", true).await;
		assert!(matches!(res, Err(Error::Conflict(_))));
		assert_eq!(adapter.read_email(item.id).await.unwrap().status, QueueStatus::Sent);

		assert!(matches!(adapter.mark_as_sent(99).await, Err(Error::NotFound)));
	}

	#[tokio::test]
	async fn test_cleanup_removes_strictly_older_items() {
		let adapter = InMemoryQueueAdapter::new();
		let age = Duration::from_secs(3600);
		let template = EmailQueueItem::from_input(
			0,
			input("signature_reminder", Priority::Normal),
			Timestamp::now(),
		);

		let old_sent = EmailQueueItem {
			id: 1,
			status: QueueStatus::Sent,
			created_at: Timestamp::ago(Duration::from_secs(7200)),
			..template.clone()
		};
		let old_pending = EmailQueueItem {
			id: 2,
			created_at: Timestamp::ago(Duration::from_secs(4000)),
			..template.clone()
		};
		let fresh =
			EmailQueueItem { id: 3, created_at: Timestamp::ago(Duration::from_secs(60)), ..template };
		adapter.restore(old_sent);
		adapter.restore(old_pending);
		adapter.restore(fresh);

		assert_eq!(adapter.cleanup_old_emails(age).await.unwrap(), 2);
		assert_eq!(adapter.len(), 1);
		assert!(adapter.read_email(3).await.is_ok());

		// New ids continue after restored ones
		let next = adapter.enqueue(input("signature_reminder", Priority::Normal)).await.unwrap();
		assert_eq!(next.id, 4);
	}
}

// vim: ts=4
