//! Email message and queue item types
//!
//! `EmailMessage` is the ephemeral, caller-owned request handed to an email sender.
//! `EmailQueueItem` is its persisted form: the data bag and the extra headers are
//! stored as opaque JSON text and only decoded by the worker at send time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::prelude::*;

/// Business object a message relates to (e.g. a signature request)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
	#[serde(rename = "type")]
	pub ref_type: Box<str>,
	pub id: Box<str>,
}

impl Reference {
	pub fn new(ref_type: impl Into<Box<str>>, id: impl Into<Box<str>>) -> Self {
		Self { ref_type: ref_type.into(), id: id.into() }
	}
}

/// Email message to be rendered and sent
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EmailMessage {
	pub to: Vec<String>,
	#[serde(default)]
	pub cc: Vec<String>,
	#[serde(default)]
	pub bcc: Vec<String>,
	/// Subject line; when empty the template frontmatter subject is used
	#[serde(default)]
	pub subject: String,
	pub template: String,
	/// Locale code (e.g. "fr"); empty means the configured default
	#[serde(default)]
	pub locale: String,
	/// Template variables
	#[serde(default)]
	pub data: serde_json::Value,
	#[serde(default)]
	pub headers: BTreeMap<String, String>,
	#[serde(default)]
	pub reference: Option<Reference>,
}

impl EmailMessage {
	pub fn new(template: impl Into<String>) -> Self {
		Self {
			template: template.into(),
			data: serde_json::Value::Object(serde_json::Map::new()),
			..Default::default()
		}
	}

	pub fn to(mut self, address: impl Into<String>) -> Self {
		self.to.push(address.into());
		self
	}

	pub fn cc(mut self, address: impl Into<String>) -> Self {
		self.cc.push(address.into());
		self
	}

	pub fn bcc(mut self, address: impl Into<String>) -> Self {
		self.bcc.push(address.into());
		self
	}

	pub fn subject(mut self, subject: impl Into<String>) -> Self {
		self.subject = subject.into();
		self
	}

	pub fn locale(mut self, locale: impl Into<String>) -> Self {
		self.locale = locale.into();
		self
	}

	pub fn data(mut self, data: serde_json::Value) -> Self {
		self.data = data;
		self
	}

	pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.insert(name.into(), value.into());
		self
	}

	pub fn reference(mut self, reference: Reference) -> Self {
		self.reference = Some(reference);
		self
	}

	/// Total number of recipients across to, cc and bcc
	pub fn recipient_count(&self) -> usize {
		self.to.len() + self.cc.len() + self.bcc.len()
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
	High,
	#[default]
	Normal,
}

impl Priority {
	/// Ordering weight, higher is fetched first
	pub fn weight(self) -> i64 {
		match self {
			Priority::High => 10,
			Priority::Normal => 0,
		}
	}

	pub fn from_weight(weight: i64) -> Self {
		if weight > 0 {
			Priority::High
		} else {
			Priority::Normal
		}
	}
}

/// Lifecycle status of a queue item
///
/// `Sent` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
	Pending,
	Sent,
	RetryPending,
	Failed,
}

impl QueueStatus {
	pub fn as_char(self) -> char {
		match self {
			QueueStatus::Pending => 'P',
			QueueStatus::Sent => 'S',
			QueueStatus::RetryPending => 'R',
			QueueStatus::Failed => 'F',
		}
	}

	pub fn from_char(c: char) -> ClResult<Self> {
		match c {
			'P' => Ok(QueueStatus::Pending),
			'S' => Ok(QueueStatus::Sent),
			'R' => Ok(QueueStatus::RetryPending),
			'F' => Ok(QueueStatus::Failed),
			other => Err(Error::DataCorruption(format!("unknown queue status '{}'", other))),
		}
	}

	pub fn is_terminal(self) -> bool {
		matches!(self, QueueStatus::Sent | QueueStatus::Failed)
	}
}

impl std::fmt::Display for QueueStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			QueueStatus::Pending => write!(f, "pending"),
			QueueStatus::Sent => write!(f, "sent"),
			QueueStatus::RetryPending => write!(f, "retry_pending"),
			QueueStatus::Failed => write!(f, "failed"),
		}
	}
}

/// Input for `QueueAdapter::enqueue`
#[derive(Clone, Debug)]
pub struct EnqueueInput {
	pub to: Vec<String>,
	pub cc: Vec<String>,
	pub bcc: Vec<String>,
	pub subject: String,
	pub template: String,
	pub locale: String,
	/// Serialized data bag
	pub data: String,
	/// Serialized extra headers
	pub headers: Option<String>,
	pub priority: Priority,
	pub max_retries: u32,
	pub reference: Option<Reference>,
	pub created_by: Option<String>,
}

/// Persisted email delivery job
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmailQueueItem {
	pub id: ItemId,
	pub to: Vec<String>,
	pub cc: Vec<String>,
	pub bcc: Vec<String>,
	pub subject: String,
	pub template: String,
	pub locale: String,
	pub data: String,
	pub headers: Option<String>,
	pub priority: Priority,
	pub retry_count: u32,
	pub max_retries: u32,
	pub status: QueueStatus,
	pub last_error: Option<String>,
	pub next_retry_at: Option<Timestamp>,
	pub reference: Option<Reference>,
	pub created_by: Option<String>,
	pub created_at: Timestamp,
	pub updated_at: Timestamp,
}

impl EmailQueueItem {
	/// Build a fresh pending item from an enqueue request
	pub fn from_input(id: ItemId, input: EnqueueInput, now: Timestamp) -> Self {
		Self {
			id,
			to: input.to,
			cc: input.cc,
			bcc: input.bcc,
			subject: input.subject,
			template: input.template,
			locale: input.locale,
			data: input.data,
			headers: input.headers,
			priority: input.priority,
			retry_count: 0,
			max_retries: input.max_retries,
			status: QueueStatus::Pending,
			last_error: None,
			next_retry_at: None,
			reference: input.reference,
			created_by: input.created_by,
			created_at: now,
			updated_at: now,
		}
	}

	/// Apply a failed attempt
	///
	/// Increments `retry_count` (never past `max_retries`) and moves the item to
	/// `RetryPending` with `next_retry_at` when a retry is allowed, else to `Failed`.
	pub fn apply_failure(
		&mut self,
		error: &str,
		should_retry: bool,
		next_retry_at: Timestamp,
		now: Timestamp,
	) {
		let can_retry = should_retry && self.retry_count < self.max_retries;
		self.retry_count = (self.retry_count + 1).min(self.max_retries);
		self.last_error = Some(error.to_string());
		self.updated_at = now;
		if can_retry {
			self.status = QueueStatus::RetryPending;
			self.next_retry_at = Some(next_retry_at);
		} else {
			self.status = QueueStatus::Failed;
			self.next_retry_at = None;
		}
	}

	pub fn apply_sent(&mut self, now: Timestamp) {
		self.status = QueueStatus::Sent;
		self.next_retry_at = None;
		self.updated_at = now;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn input(max_retries: u32) -> EnqueueInput {
		EnqueueInput {
			to: vec!["user@example.com".into()],
			cc: vec![],
			bcc: vec![],
			subject: String::new(),
			template: "signature_reminder".into(),
			locale: "fr".into(),
			data: "{}".into(),
			headers: None,
			priority: Priority::Normal,
			max_retries,
			reference: None,
			created_by: None,
		}
	}

	#[test]
	fn test_status_char_roundtrip() {
		for status in [
			QueueStatus::Pending,
			QueueStatus::Sent,
			QueueStatus::RetryPending,
			QueueStatus::Failed,
		] {
			assert_eq!(QueueStatus::from_char(status.as_char()).ok(), Some(status));
		}
		assert!(matches!(QueueStatus::from_char('X'), Err(Error::DataCorruption(_))));
	}

	#[test]
	fn test_failure_moves_to_retry_pending() {
		let mut item = EmailQueueItem::from_input(1, input(3), Timestamp(100));
		item.apply_failure("connection refused", true, Timestamp(160), Timestamp(100));
		assert_eq!(item.status, QueueStatus::RetryPending);
		assert_eq!(item.retry_count, 1);
		assert_eq!(item.next_retry_at, Some(Timestamp(160)));
		assert_eq!(item.last_error.as_deref(), Some("connection refused"));
	}

	#[test]
	fn test_failure_never_exceeds_max_retries() {
		let mut item = EmailQueueItem::from_input(1, input(2), Timestamp(100));
		for _ in 0..5 {
			item.apply_failure("timeout", true, Timestamp(200), Timestamp(100));
			assert!(item.retry_count <= item.max_retries);
		}
		assert_eq!(item.status, QueueStatus::Failed);
		assert_eq!(item.retry_count, 2);
		assert!(item.next_retry_at.is_none());
	}

	#[test]
	fn test_non_retryable_failure_is_terminal() {
		let mut item = EmailQueueItem::from_input(1, input(3), Timestamp(100));
		item.apply_failure("data corruption", false, Timestamp(200), Timestamp(100));
		assert_eq!(item.status, QueueStatus::Failed);
		assert!(item.status.is_terminal());
	}

	#[test]
	fn test_message_builder() {
		let msg = EmailMessage::new("magic_link")
			.to("a@example.com")
			.cc("b@example.com")
			.bcc("c@example.com")
			.locale("fr")
			.header("X-Campaign", "q3")
			.reference(Reference::new("document", "42"));
		assert_eq!(msg.recipient_count(), 3);
		assert_eq!(msg.headers.get("X-Campaign").map(String::as_str), Some("q3"));
		assert!(msg.data.is_object());
	}
}

// vim: ts=4
