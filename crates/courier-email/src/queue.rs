//! Queued email sender
//!
//! Persists the message as a queue item instead of transmitting it. Delivery
//! happens later in the worker, so callers only ever see persistence errors.

use async_trait::async_trait;
use std::sync::Arc;

use courier_types::email::{EmailMessage, EnqueueInput, Priority};
use courier_types::queue_adapter::QueueAdapter;

use crate::prelude::*;
use crate::EmailSender;

/// Templates delivered ahead of the bulk traffic
const HIGH_PRIORITY_TEMPLATES: &[&str] = &["magic_link", "email_verification", "password_reset"];

pub fn priority_for_template(template: &str) -> Priority {
	if HIGH_PRIORITY_TEMPLATES.contains(&template) {
		Priority::High
	} else {
		Priority::Normal
	}
}

#[derive(Debug)]
pub struct QueuedSender {
	adapter: Arc<dyn QueueAdapter>,
	max_retries: u32,
	created_by: Option<String>,
}

impl QueuedSender {
	pub fn new(adapter: Arc<dyn QueueAdapter>, max_retries: u32) -> Self {
		Self { adapter, max_retries, created_by: None }
	}

	/// Record who enqueues through this sender (service or user identity)
	pub fn created_by(mut self, created_by: impl Into<String>) -> Self {
		self.created_by = Some(created_by.into());
		self
	}

	fn to_input(&self, message: &EmailMessage) -> ClResult<EnqueueInput> {
		let data = if message.data.is_null() {
			"{}".to_string()
		} else {
			serde_json::to_string(&message.data)?
		};
		let headers = if message.headers.is_empty() {
			None
		} else {
			Some(serde_json::to_string(&message.headers)?)
		};

		Ok(EnqueueInput {
			to: message.to.clone(),
			cc: message.cc.clone(),
			bcc: message.bcc.clone(),
			subject: message.subject.clone(),
			template: message.template.clone(),
			locale: message.locale.clone(),
			data,
			headers,
			priority: priority_for_template(&message.template),
			max_retries: self.max_retries,
			reference: message.reference.clone(),
			created_by: self.created_by.clone(),
		})
	}
}

#[async_trait]
impl EmailSender for QueuedSender {
	async fn send(&self, message: &EmailMessage) -> ClResult<()> {
		let input = self.to_input(message)?;
		let item = self.adapter.enqueue(input).await?;
		debug!(
			"Email '{}' queued as #{} ({:?} priority)",
			item.template, item.id, item.priority
		);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::memory::InMemoryQueueAdapter;
	use courier_types::email::{QueueStatus, Reference};

	#[test]
	fn test_priority_lookup() {
		assert_eq!(priority_for_template("magic_link"), Priority::High);
		assert_eq!(priority_for_template("email_verification"), Priority::High);
		assert_eq!(priority_for_template("password_reset"), Priority::High);
		assert_eq!(priority_for_template("signature_reminder"), Priority::Normal);
		assert_eq!(priority_for_template("Magic_Link"), Priority::Normal);
	}

	#[tokio::test]
	async fn test_send_enqueues_item() {
		let adapter = InMemoryQueueAdapter::new();
		let sender = QueuedSender::new(adapter.clone(), 3).created_by("signing-service");

		let msg = EmailMessage::new("magic_link")
			.to("alice@example.com")
			.locale("fr")
			.data(serde_json::json!({ "link": "https://example.com/l/abc" }))
			.header("X-Request-Id", "r-1")
			.reference(Reference::new("login", "abc"));
		sender.send(&msg).await.unwrap();

		let items = adapter.get_next_to_process(10).await.unwrap();
		assert_eq!(items.len(), 1);
		let item = &items[0];
		assert_eq!(item.status, QueueStatus::Pending);
		assert_eq!(item.priority, Priority::High);
		assert_eq!(item.max_retries, 3);
		assert_eq!(item.retry_count, 0);
		assert_eq!(item.locale, "fr");
		assert_eq!(item.created_by.as_deref(), Some("signing-service"));
		assert_eq!(item.reference.as_ref().map(|r| r.id.as_ref()), Some("abc"));

		let data: serde_json::Value = serde_json::from_str(&item.data).unwrap();
		assert_eq!(data["link"], "https://example.com/l/abc");
		let headers: serde_json::Value =
			serde_json::from_str(item.headers.as_deref().unwrap()).unwrap();
		assert_eq!(headers["X-Request-Id"], "r-1");
	}

	#[tokio::test]
	async fn test_null_data_is_stored_as_empty_object() {
		let adapter = InMemoryQueueAdapter::new();
		let sender = QueuedSender::new(adapter.clone(), 3);

		let msg = EmailMessage { template: "notice".into(), ..EmailMessage::default() }
			.to("bob@example.com");
		sender.send(&msg).await.unwrap();

		let item = adapter.read_email(1).await.unwrap();
		assert_eq!(item.data, "{}");
		assert!(item.headers.is_none());
		assert_eq!(item.priority, Priority::Normal);
	}
}

// vim: ts=4
