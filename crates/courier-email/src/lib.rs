//! Email delivery with templates, SMTP and a persisted queue
//!
//! This crate provides:
//! - Template rendering with locale fallback and translations (Handlebars)
//! - SMTP email sending with lettre
//! - A queued sender persisting emails through a `QueueAdapter`
//! - A background worker draining the queue with retries
//!
//! Direct and queued delivery share the `EmailSender` trait, so calling code picks
//! synchronous or asynchronous delivery by injection.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod memory;
pub mod queue;
pub mod retry;
pub mod sender;
pub mod settings;
pub mod template;
pub mod worker;

pub use memory::InMemoryQueueAdapter;
pub use queue::QueuedSender;
pub use sender::SmtpSender;
pub use settings::{EmailSettings, Settings, WorkerSettings};
pub use template::TemplateEngine;
pub use worker::{EmailWorker, WorkerState};

mod prelude;

use async_trait::async_trait;
use std::sync::Arc;

use courier_types::email::EmailMessage;
use courier_types::event_publisher::EventPublisher;
use courier_types::queue_adapter::QueueAdapter;

use crate::prelude::*;

/// Capability to deliver an email message
///
/// `SmtpSender` delivers right away and reports the outcome, `QueuedSender` only
/// persists the message for the worker.
#[async_trait]
pub trait EmailSender: Send + Sync {
	async fn send(&self, message: &EmailMessage) -> ClResult<()>;
}

/// Email module - wires renderer, senders and worker from settings
#[derive(Debug)]
pub struct EmailModule {
	pub template_engine: Arc<TemplateEngine>,
	pub sender: Arc<SmtpSender>,
	pub queue: Arc<QueuedSender>,
	pub worker: EmailWorker,
}

impl EmailModule {
	pub fn new(
		settings: Settings,
		adapter: Arc<dyn QueueAdapter>,
		publisher: Option<Arc<dyn EventPublisher>>,
	) -> Self {
		let template_engine = Arc::new(TemplateEngine::from_settings(&settings.email));
		let max_retries = settings.email.max_retries;
		let sender = Arc::new(SmtpSender::new(settings.email, template_engine.clone()));
		let queue = Arc::new(QueuedSender::new(adapter.clone(), max_retries));

		let mut worker = EmailWorker::new(adapter, sender.clone(), settings.worker);
		if let Some(publisher) = publisher {
			worker = worker.with_publisher(publisher);
		}

		Self { template_engine, sender, queue, worker }
	}

	/// Send email immediately (bypass the queue)
	pub async fn send_now(&self, message: &EmailMessage) -> ClResult<()> {
		self.sender.send(message).await
	}

	/// Queue email for delivery by the worker
	pub async fn schedule(&self, message: &EmailMessage) -> ClResult<()> {
		self.queue.send(message).await
	}
}

// vim: ts=4
