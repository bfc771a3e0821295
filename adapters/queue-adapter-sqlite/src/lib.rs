//! SQLite-backed email queue adapter
//!
//! Items are claimed with a single `UPDATE ... RETURNING` statement that sets a
//! lease (`locked_until`), so overlapping dispatch cycles never fetch the same
//! item twice while the lease holds. Marking an item releases its lease.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

mod queue;
mod schema;
mod utils;

use async_trait::async_trait;
use sqlx::sqlite::{self, SqlitePool};
use std::path::Path;
use std::time::Duration;

use courier_types::email::{EmailQueueItem, EnqueueInput, QueueStatus};
use courier_types::prelude::*;
use courier_types::queue_adapter::{QueueAdapter, RetryPolicy};

/// Seconds a fetched item stays claimed
pub const DEFAULT_LEASE_SECS: u64 = 600;

#[derive(Debug)]
pub struct QueueAdapterSqlite {
	db: SqlitePool,
	retry_policy: RetryPolicy,
	lease_secs: u64,
}

impl QueueAdapterSqlite {
	pub async fn new(path: impl AsRef<Path>) -> ClResult<Self> {
		Self::with_policy(path, RetryPolicy::default(), DEFAULT_LEASE_SECS).await
	}

	pub async fn with_policy(
		path: impl AsRef<Path>,
		retry_policy: RetryPolicy,
		lease_secs: u64,
	) -> ClResult<Self> {
		let path = path.as_ref();
		if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
			tokio::fs::create_dir_all(parent).await?;
		}

		let opts = sqlite::SqliteConnectOptions::new()
			.filename(path)
			.create_if_missing(true)
			.journal_mode(sqlite::SqliteJournalMode::Wal);
		let db = sqlite::SqlitePoolOptions::new()
			.max_connections(5)
			.connect_with(opts)
			.await
			.inspect_err(|err| error!("DbError: {:#?}", err))
			.or(Err(Error::DbError))?;

		schema::init_db(&db)
			.await
			.inspect_err(|err| error!("DbError: {:#?}", err))
			.or(Err(Error::DbError))?;

		info!("Email queue database opened at {}", path.display());
		Ok(Self { db, retry_policy, lease_secs })
	}
}

#[async_trait]
impl QueueAdapter for QueueAdapterSqlite {
	async fn enqueue(&self, input: EnqueueInput) -> ClResult<EmailQueueItem> {
		queue::enqueue(&self.db, input).await
	}

	async fn get_next_to_process(&self, limit: u32) -> ClResult<Vec<EmailQueueItem>> {
		queue::claim(&self.db, QueueStatus::Pending, limit, self.lease_secs).await
	}

	async fn get_retryable_emails(&self, limit: u32) -> ClResult<Vec<EmailQueueItem>> {
		queue::claim(&self.db, QueueStatus::RetryPending, limit, self.lease_secs).await
	}

	async fn mark_as_sent(&self, id: ItemId) -> ClResult<()> {
		queue::mark_as_sent(&self.db, id).await
	}

	async fn mark_as_failed(&self, id: ItemId, error: &str, should_retry: bool) -> ClResult<()> {
		queue::mark_as_failed(&self.db, &self.retry_policy, id, error, should_retry).await
	}

	async fn cleanup_old_emails(&self, older_than: Duration) -> ClResult<u64> {
		queue::cleanup(&self.db, older_than).await
	}

	async fn read_email(&self, id: ItemId) -> ClResult<EmailQueueItem> {
		queue::read(&self.db, id).await
	}
}


// vim: ts=4
