//! Email queue queries

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use courier_types::email::{EmailQueueItem, EnqueueInput, QueueStatus};
use courier_types::prelude::*;
use courier_types::queue_adapter::RetryPolicy;

use crate::utils::{
	ITEM_COLUMNS, db_err, encode_list, inspect, item_from_row, sort_for_delivery, to_db_id,
};

/// Insert a new pending item
pub(crate) async fn enqueue(db: &SqlitePool, input: EnqueueInput) -> ClResult<EmailQueueItem> {
	let now = Timestamp::now();
	let (ref_type, ref_id) = match &input.reference {
		Some(r) => (Some(r.ref_type.as_ref()), Some(r.id.as_ref())),
		None => (None, None),
	};

	let row = sqlx::query(&format!(
		"INSERT INTO email_queue (recipients, cc, bcc, subject, template, locale, data, headers,
			priority, retry_count, max_retries, status, ref_type, ref_id, created_by,
			created_at, updated_at)
		VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, 'P', ?, ?, ?, ?, ?)
		RETURNING {}",
		ITEM_COLUMNS
	))
	.bind(encode_list(&input.to)?)
	.bind(encode_list(&input.cc)?)
	.bind(encode_list(&input.bcc)?)
	.bind(&input.subject)
	.bind(&input.template)
	.bind(&input.locale)
	.bind(&input.data)
	.bind(input.headers.as_deref())
	.bind(input.priority.weight())
	.bind(i64::from(input.max_retries))
	.bind(ref_type)
	.bind(ref_id)
	.bind(input.created_by.as_deref())
	.bind(now.0)
	.bind(now.0)
	.fetch_one(db)
	.await
	.map_err(|e| {
		error!("Failed to enqueue email: {}", e);
		Error::DbError
	})?;

	item_from_row(&row)
}

/// Lease up to `limit` unleased items in `status` that are due, best first
pub(crate) async fn claim(
	db: &SqlitePool,
	status: QueueStatus,
	limit: u32,
	lease_secs: u64,
) -> ClResult<Vec<EmailQueueItem>> {
	let now = Timestamp::now();
	let rows = sqlx::query(&format!(
		"UPDATE email_queue SET locked_until = ?1
		WHERE email_id IN (
			SELECT email_id FROM email_queue
			WHERE status = ?2
				AND (locked_until IS NULL OR locked_until <= ?3)
				AND (next_retry_at IS NULL OR next_retry_at <= ?3)
			ORDER BY priority DESC, created_at, email_id
			LIMIT ?4
		)
		RETURNING {}",
		ITEM_COLUMNS
	))
	.bind(now.add_seconds(lease_secs).0)
	.bind(status.as_char().to_string())
	.bind(now.0)
	.bind(i64::from(limit))
	.fetch_all(db)
	.await
	.map_err(db_err)?;

	let mut items = Vec::with_capacity(rows.len());
	for row in &rows {
		match item_from_row(row) {
			Ok(item) => items.push(item),
			Err(err) => fail_undecodable(db, row, &err).await,
		}
	}
	// RETURNING does not keep the subquery order
	sort_for_delivery(&mut items);
	Ok(items)
}

/// Resolve a claimed row that cannot be decoded as terminally failed
///
/// The row is never handed out, so it would otherwise be claimed again on every
/// lease expiry.
async fn fail_undecodable(db: &SqlitePool, row: &SqliteRow, err: &Error) {
	let Ok(id) = row.try_get::<i64, _>("email_id") else {
		error!("Claimed email row without id: {}", err);
		return;
	};
	error!("Email #{} cannot be decoded, marking failed: {}", id, err);

	let res = sqlx::query(
		"UPDATE email_queue SET status = 'F', last_error = ?1, next_retry_at = NULL,
			locked_until = NULL, updated_at = ?2
		WHERE email_id = ?3",
	)
	.bind(err.to_string())
	.bind(Timestamp::now().0)
	.bind(id)
	.execute(db)
	.await;
	if let Err(e) = res {
		inspect(&e);
	}
}

pub(crate) async fn read(db: &SqlitePool, id: ItemId) -> ClResult<EmailQueueItem> {
	let row = sqlx::query(&format!("SELECT {} FROM email_queue WHERE email_id = ?", ITEM_COLUMNS))
		.bind(to_db_id(id)?)
		.fetch_one(db)
		.await
		.map_err(db_err)?;
	item_from_row(&row)
}

fn ensure_open(item: &EmailQueueItem) -> ClResult<()> {
	if item.status.is_terminal() {
		return Err(Error::Conflict(format!("email #{} is already {}", item.id, item.status)));
	}
	Ok(())
}

/// Write back the mutable state of an item and release its lease
async fn store_outcome(
	db: &SqlitePool,
	item: &EmailQueueItem,
	expected: QueueStatus,
) -> ClResult<()> {
	let res = sqlx::query(
		"UPDATE email_queue SET status = ?1, retry_count = ?2, last_error = ?3,
			next_retry_at = ?4, locked_until = NULL, updated_at = ?5
		WHERE email_id = ?6 AND status = ?7",
	)
	.bind(item.status.as_char().to_string())
	.bind(i64::from(item.retry_count))
	.bind(item.last_error.as_deref())
	.bind(item.next_retry_at.map(|t| t.0))
	.bind(item.updated_at.0)
	.bind(to_db_id(item.id)?)
	.bind(expected.as_char().to_string())
	.execute(db)
	.await
	.map_err(db_err)?;

	if res.rows_affected() == 0 {
		// Someone else resolved the item in between
		return Err(Error::Conflict(format!("email #{} changed concurrently", item.id)));
	}
	Ok(())
}

pub(crate) async fn mark_as_sent(db: &SqlitePool, id: ItemId) -> ClResult<()> {
	let mut item = read(db, id).await?;
	ensure_open(&item)?;
	let expected = item.status;
	item.apply_sent(Timestamp::now());
	store_outcome(db, &item, expected).await
}

pub(crate) async fn mark_as_failed(
	db: &SqlitePool,
	retry_policy: &RetryPolicy,
	id: ItemId,
	error: &str,
	should_retry: bool,
) -> ClResult<()> {
	let mut item = read(db, id).await?;
	ensure_open(&item)?;
	let expected = item.status;

	let now = Timestamp::now();
	let backoff = retry_policy.calculate_backoff(item.retry_count);
	item.apply_failure(error, should_retry, now.add_seconds(backoff), now);
	if item.status == QueueStatus::RetryPending {
		debug!("Email #{} retry in {} seconds", id, backoff);
	}
	store_outcome(db, &item, expected).await
}

pub(crate) async fn cleanup(db: &SqlitePool, older_than: Duration) -> ClResult<u64> {
	let cutoff = Timestamp::ago(older_than);
	let res = sqlx::query("DELETE FROM email_queue WHERE created_at < ?")
		.bind(cutoff.0)
		.execute(db)
		.await
		.map_err(db_err)?;
	Ok(res.rows_affected())
}

// vim: ts=4
