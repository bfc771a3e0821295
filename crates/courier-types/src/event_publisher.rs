//! Event publisher. Optional observer of delivery outcomes.

use async_trait::async_trait;
use serde::Serialize;

use crate::email::EmailQueueItem;
use crate::prelude::*;

pub const EVENT_REMINDER_SENT: &str = "reminder.sent";
pub const EVENT_REMINDER_FAILED: &str = "reminder.failed";

#[async_trait]
pub trait EventPublisher: Send + Sync {
	async fn publish(&self, event_type: &str, payload: serde_json::Value) -> ClResult<()>;
}

/// Payload published for a delivery outcome
#[derive(Debug, Serialize)]
pub struct DeliveryEvent<'a> {
	pub email_id: ItemId,
	pub template: &'a str,
	pub recipients: &'a [String],
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reference_id: Option<&'a str>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reference_type: Option<&'a str>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<&'a str>,
}

impl<'a> DeliveryEvent<'a> {
	pub fn from_item(item: &'a EmailQueueItem, error: Option<&'a str>) -> Self {
		Self {
			email_id: item.id,
			template: &item.template,
			recipients: &item.to,
			reference_id: item.reference.as_ref().map(|r| r.id.as_ref()),
			reference_type: item.reference.as_ref().map(|r| r.ref_type.as_ref()),
			error,
		}
	}
}

// vim: ts=4
