//! Utility functions for database operations

use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use courier_types::email::{EmailQueueItem, Priority, QueueStatus, Reference};
use courier_types::prelude::*;

/// Columns read by `item_from_row`, in order
pub(crate) const ITEM_COLUMNS: &str = "email_id, recipients, cc, bcc, subject, template, locale, \
	data, headers, priority, retry_count, max_retries, status, last_error, next_retry_at, \
	ref_type, ref_id, created_by, created_at, updated_at";

/// Log database errors
pub(crate) fn inspect(err: &sqlx::Error) {
	warn!("DB: {:#?}", err);
}

/// Map a sqlx error, logging it
pub(crate) fn db_err(err: sqlx::Error) -> Error {
	match err {
		sqlx::Error::RowNotFound => Error::NotFound,
		err => {
			inspect(&err);
			Error::DbError
		}
	}
}

pub(crate) fn to_db_id(id: ItemId) -> ClResult<i64> {
	i64::try_from(id).map_err(|_| Error::NotFound)
}

pub(crate) fn encode_list(list: &[String]) -> ClResult<String> {
	Ok(serde_json::to_string(list)?)
}

fn decode_list(id: i64, column: &str, raw: &str) -> ClResult<Vec<String>> {
	serde_json::from_str(raw)
		.map_err(|e| Error::DataCorruption(format!("email #{}: invalid {}: {}", id, column, e)))
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> ClResult<T>
where
	T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
	row.try_get(column).map_err(db_err)
}

fn get_u32(row: &SqliteRow, column: &str) -> ClResult<u32> {
	let value: i64 = get(row, column)?;
	u32::try_from(value).map_err(|_| Error::DataCorruption(format!("{} out of range", column)))
}

/// Decode a queue row selected with `ITEM_COLUMNS`
pub(crate) fn item_from_row(row: &SqliteRow) -> ClResult<EmailQueueItem> {
	let id: i64 = get(row, "email_id")?;
	let status: String = get(row, "status")?;
	let status = QueueStatus::from_char(status.chars().next().unwrap_or(' '))?;

	let reference = match (
		get::<Option<String>>(row, "ref_type")?,
		get::<Option<String>>(row, "ref_id")?,
	) {
		(Some(ref_type), Some(ref_id)) => Some(Reference::new(ref_type, ref_id)),
		_ => None,
	};

	Ok(EmailQueueItem {
		id: ItemId::try_from(id)
			.map_err(|_| Error::DataCorruption(format!("invalid email id {}", id)))?,
		to: decode_list(id, "recipients", &get::<String>(row, "recipients")?)?,
		cc: decode_list(id, "cc", &get::<String>(row, "cc")?)?,
		bcc: decode_list(id, "bcc", &get::<String>(row, "bcc")?)?,
		subject: get(row, "subject")?,
		template: get(row, "template")?,
		locale: get(row, "locale")?,
		data: get(row, "data")?,
		headers: get(row, "headers")?,
		priority: Priority::from_weight(get(row, "priority")?),
		retry_count: get_u32(row, "retry_count")?,
		max_retries: get_u32(row, "max_retries")?,
		status,
		last_error: get(row, "last_error")?,
		next_retry_at: get::<Option<i64>>(row, "next_retry_at")?.map(Timestamp),
		reference,
		created_by: get(row, "created_by")?,
		created_at: Timestamp(get(row, "created_at")?),
		updated_at: Timestamp(get(row, "updated_at")?),
	})
}

/// Fetch order: priority first, then age
pub(crate) fn sort_for_delivery(items: &mut [EmailQueueItem]) {
	items.sort_by_key(|item| (-item.priority.weight(), item.created_at, item.id));
}

// vim: ts=4
