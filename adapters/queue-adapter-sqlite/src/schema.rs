//! Database schema initialization and migrations

use sqlx::{Sqlite, SqlitePool, Transaction};

/// Get the current database version from vars table
async fn get_db_version(tx: &mut Transaction<'_, Sqlite>) -> i64 {
	sqlx::query_scalar::<_, String>("SELECT value FROM vars WHERE key = 'db_version'")
		.fetch_optional(&mut **tx)
		.await
		.ok()
		.flatten()
		.and_then(|v| v.parse().ok())
		.unwrap_or(0)
}

/// Set the database version in vars table
async fn set_db_version(tx: &mut Transaction<'_, Sqlite>, version: i64) {
	let _ = sqlx::query("INSERT OR REPLACE INTO vars (key, value) VALUES ('db_version', ?)")
		.bind(version.to_string())
		.execute(&mut **tx)
		.await;
}

// Current schema version - update this when adding new migrations
const CURRENT_DB_VERSION: i64 = 1;

/// Initialize the database schema
pub(crate) async fn init_db(db: &SqlitePool) -> Result<(), sqlx::Error> {
	let mut tx = db.begin().await?;

	// Create vars table first (needed for version tracking)
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS vars (
		key text NOT NULL,
		value text NOT NULL,
		created_at INTEGER DEFAULT (unixepoch()),
		updated_at INTEGER DEFAULT (unixepoch()),
		PRIMARY KEY(key)
	)",
	)
	.execute(&mut *tx)
	.await?;

	let version = get_db_version(&mut tx).await;

	// Email queue
	// status: P=pending, S=sent, R=retry pending, F=failed
	// recipients, cc, bcc: JSON arrays
	// locked_until: claim lease set by the fetch queries
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS email_queue (
			email_id integer PRIMARY KEY AUTOINCREMENT,
			recipients text NOT NULL,
			cc text NOT NULL DEFAULT '[]',
			bcc text NOT NULL DEFAULT '[]',
			subject text NOT NULL DEFAULT '',
			template text NOT NULL,
			locale text NOT NULL DEFAULT '',
			data text NOT NULL,
			headers text,
			priority integer NOT NULL DEFAULT 0,
			retry_count integer NOT NULL DEFAULT 0,
			max_retries integer NOT NULL DEFAULT 3,
			status char(1) NOT NULL DEFAULT 'P',
			last_error text,
			next_retry_at INTEGER,
			locked_until INTEGER,
			ref_type text,
			ref_id text,
			created_by text,
			created_at INTEGER NOT NULL DEFAULT (unixepoch()),
			updated_at INTEGER NOT NULL DEFAULT (unixepoch())
		)",
	)
	.execute(&mut *tx)
	.await?;
	sqlx::query(
		"CREATE INDEX IF NOT EXISTS idx_email_queue_due ON email_queue (status, priority DESC, created_at)",
	)
	.execute(&mut *tx)
	.await?;
	sqlx::query("CREATE INDEX IF NOT EXISTS idx_email_queue_created ON email_queue (created_at)")
		.execute(&mut *tx)
		.await?;
	sqlx::query("CREATE INDEX IF NOT EXISTS idx_email_queue_ref ON email_queue (ref_type, ref_id)")
		.execute(&mut *tx)
		.await?;

	// Fresh database: schema already current
	if version == 0 {
		set_db_version(&mut tx, CURRENT_DB_VERSION).await;
	}

	tx.commit().await?;

	Ok(())
}

// vim: ts=4
