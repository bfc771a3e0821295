//! Queue worker
//!
//! Drains the email queue in the background. Two loops run while the worker is
//! running: a dispatch loop polling the adapter for due items and sending them
//! with bounded concurrency, and a cleanup loop purging old items.
//!
//! Every item is resolved by writing an outcome back to the adapter. Per-item
//! failures are never propagated; adapter errors only abort the current cycle.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use courier_types::email::{EmailMessage, EmailQueueItem};
use courier_types::event_publisher::{
	DeliveryEvent, EventPublisher, EVENT_REMINDER_FAILED, EVENT_REMINDER_SENT,
};
use courier_types::queue_adapter::QueueAdapter;

use crate::prelude::*;
use crate::retry;
use crate::settings::WorkerSettings;
use crate::EmailSender;

/// Lifecycle state of a worker instance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
	Stopped,
	Starting,
	Running,
	Stopping,
}

struct Control {
	state: WorkerState,
	cancel: Option<CancellationToken>,
	loops: JoinSet<()>,
}

struct Inner {
	adapter: Arc<dyn QueueAdapter>,
	sender: Arc<dyn EmailSender>,
	publisher: Option<Arc<dyn EventPublisher>>,
	settings: WorkerSettings,
}

pub struct EmailWorker {
	inner: Arc<Inner>,
	control: Mutex<Control>,
}

impl std::fmt::Debug for EmailWorker {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EmailWorker")
			.field("adapter", &self.inner.adapter)
			.field("settings", &self.inner.settings)
			.field("state", &self.state())
			.finish_non_exhaustive()
	}
}

/// `tokio::time::interval` rejects a zero period
fn non_zero(period: Duration) -> Duration {
	period.max(Duration::from_millis(1))
}

/// Rebuild the message from a stored item
///
/// A data bag that does not decode to a JSON object is `DataCorruption`. Broken
/// headers are dropped with a warning.
pub fn decode_message(item: &EmailQueueItem) -> ClResult<EmailMessage> {
	let data: serde_json::Value = serde_json::from_str(&item.data).map_err(|e| {
		Error::DataCorruption(format!("email #{}: invalid data payload: {}", item.id, e))
	})?;
	let data = match data {
		serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
		serde_json::Value::Object(_) => data,
		_ => {
			return Err(Error::DataCorruption(format!(
				"email #{}: data payload is not an object",
				item.id
			)));
		}
	};

	let headers = match item.headers.as_deref() {
		Some(raw) if !raw.trim().is_empty() => {
			serde_json::from_str::<BTreeMap<String, String>>(raw).unwrap_or_else(|e| {
				warn!("Email #{}: dropping undecodable headers: {}", item.id, e);
				BTreeMap::new()
			})
		}
		_ => BTreeMap::new(),
	};

	Ok(EmailMessage {
		to: item.to.clone(),
		cc: item.cc.clone(),
		bcc: item.bcc.clone(),
		subject: item.subject.clone(),
		template: item.template.clone(),
		locale: item.locale.clone(),
		data,
		headers,
		reference: item.reference.clone(),
	})
}

impl Inner {
	/// Fetch due items and send them, at most `max_concurrency` at a time
	async fn process_batch(self: &Arc<Self>) -> ClResult<usize> {
		let limit = self.settings.batch_size;
		let mut items = self.adapter.get_next_to_process(limit).await?;
		if items.is_empty() {
			items = self.adapter.get_retryable_emails(limit).await?;
		}
		if items.is_empty() {
			return Ok(0);
		}

		let count = items.len();
		debug!("Processing {} queued email(s)", count);

		let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
		let mut tasks = JoinSet::new();
		for item in items {
			let permit = semaphore
				.clone()
				.acquire_owned()
				.await
				.map_err(|_| Error::Internal("dispatch semaphore closed".into()))?;
			let inner = self.clone();
			tasks.spawn(async move {
				inner.process_item(item).await;
				drop(permit);
			});
		}

		while let Some(res) = tasks.join_next().await {
			if let Err(e) = res {
				error!("Email dispatch task failed: {}", e);
			}
		}
		Ok(count)
	}

	async fn process_item(&self, item: EmailQueueItem) {
		let message = match decode_message(&item) {
			Ok(message) => message,
			Err(e) => {
				warn!("Email #{} cannot be decoded, giving up: {}", item.id, e);
				self.record_failure(&item, &e, false).await;
				return;
			}
		};

		match self.sender.send(&message).await {
			Ok(()) => {
				if let Err(e) = self.adapter.mark_as_sent(item.id).await {
					error!("Failed to mark email #{} as sent: {}", item.id, e);
				}
				info!("Email #{} ({}) sent", item.id, item.template);
				self.publish(EVENT_REMINDER_SENT, &item, None).await;
			}
			Err(e) => {
				let should_retry = retry::should_retry(&e, item.retry_count, item.max_retries);
				info!(
					"Email #{} failed (attempt {}/{}), retry: {}: {}",
					item.id,
					item.retry_count + 1,
					item.max_retries,
					should_retry,
					e
				);
				self.record_failure(&item, &e, should_retry).await;
			}
		}
	}

	async fn record_failure(&self, item: &EmailQueueItem, err: &Error, should_retry: bool) {
		let error = err.to_string();
		if let Err(e) = self.adapter.mark_as_failed(item.id, &error, should_retry).await {
			error!("Failed to mark email #{} as failed: {}", item.id, e);
		}
		if !should_retry {
			self.publish(EVENT_REMINDER_FAILED, item, Some(&error)).await;
		}
	}

	/// Best-effort event fan-out
	async fn publish(&self, event_type: &str, item: &EmailQueueItem, error: Option<&str>) {
		let Some(publisher) = &self.publisher else { return };

		let payload = match serde_json::to_value(DeliveryEvent::from_item(item, error)) {
			Ok(payload) => payload,
			Err(e) => {
				warn!("Failed to serialize {} event: {}", event_type, e);
				return;
			}
		};
		if let Err(e) = publisher.publish(event_type, payload).await {
			warn!("Failed to publish {} event for email #{}: {}", event_type, item.id, e);
		}
	}

	/// One dispatch cycle under the batch budget
	async fn dispatch_cycle(self: &Arc<Self>) -> ClResult<usize> {
		match tokio::time::timeout(self.settings.batch_timeout, self.process_batch()).await {
			Ok(res) => res,
			Err(_) => {
				warn!("Email batch exceeded {:?}", self.settings.batch_timeout);
				Err(Error::Timeout)
			}
		}
	}

	async fn cleanup_cycle(&self) -> ClResult<u64> {
		let deleted = self.adapter.cleanup_old_emails(self.settings.cleanup_age).await?;
		if deleted > 0 {
			info!("Cleaned up {} old email(s)", deleted);
		}
		Ok(deleted)
	}

	async fn dispatch_loop(self: Arc<Self>, cancel: CancellationToken) {
		// First tick completes immediately
		let mut ticker = tokio::time::interval(non_zero(self.settings.poll_interval));
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				biased;
				() = cancel.cancelled() => break,
				_ = ticker.tick() => {}
			}
			if let Err(e) = self.dispatch_cycle().await {
				warn!("Email dispatch cycle failed: {}", e);
			}
		}
		debug!("Email dispatch loop stopped");
	}

	async fn cleanup_loop(self: Arc<Self>, cancel: CancellationToken) {
		let period = non_zero(self.settings.cleanup_interval);
		let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				biased;
				() = cancel.cancelled() => break,
				_ = ticker.tick() => {}
			}
			if let Err(e) = self.cleanup_cycle().await {
				warn!("Email cleanup failed: {}", e);
			}
		}
		debug!("Email cleanup loop stopped");
	}
}

impl EmailWorker {
	pub fn new(
		adapter: Arc<dyn QueueAdapter>,
		sender: Arc<dyn EmailSender>,
		settings: WorkerSettings,
	) -> Self {
		Self {
			inner: Arc::new(Inner { adapter, sender, publisher: None, settings }),
			control: Mutex::new(Control {
				state: WorkerState::Stopped,
				cancel: None,
				loops: JoinSet::new(),
			}),
		}
	}

	/// Attach an event publisher. Only possible before the worker is started.
	pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
		if let Some(inner) = Arc::get_mut(&mut self.inner) {
			inner.publisher = Some(publisher);
		} else {
			warn!("Email worker already shared, publisher not attached");
		}
		self
	}

	pub fn state(&self) -> WorkerState {
		self.control.lock().state
	}

	/// Spawn the dispatch and cleanup loops. Must be called within a tokio runtime.
	pub fn start(&self) -> ClResult<()> {
		let mut control = self.control.lock();
		if control.state != WorkerState::Stopped {
			return Err(Error::Conflict(format!("email worker is {:?}", control.state)));
		}
		control.state = WorkerState::Starting;

		let cancel = CancellationToken::new();
		control.loops.spawn(self.inner.clone().dispatch_loop(cancel.clone()));
		control.loops.spawn(self.inner.clone().cleanup_loop(cancel.clone()));
		control.cancel = Some(cancel);
		control.state = WorkerState::Running;

		info!(
			"Email worker started (batch size {}, concurrency {}, poll every {:?})",
			self.inner.settings.batch_size,
			self.inner.settings.max_concurrency,
			self.inner.settings.poll_interval
		);
		Ok(())
	}

	/// Stop polling and wait for the loops to finish
	///
	/// Sends already dispatched may finish within `shutdown_timeout`. Loops still
	/// running after it are aborted together with their in-flight sends, so a
	/// restarted worker never overlaps with the previous run.
	pub async fn stop(&self) -> ClResult<()> {
		let (cancel, mut loops) = {
			let mut control = self.control.lock();
			if control.state != WorkerState::Running {
				return Err(Error::Conflict(format!("email worker is {:?}", control.state)));
			}
			control.state = WorkerState::Stopping;
			(control.cancel.take(), std::mem::take(&mut control.loops))
		};

		if let Some(cancel) = cancel {
			cancel.cancel();
		}

		let wait = async {
			while let Some(res) = loops.join_next().await {
				if let Err(e) = res {
					error!("Email worker loop failed: {}", e);
				}
			}
		};
		if tokio::time::timeout(self.inner.settings.shutdown_timeout, wait).await.is_err() {
			warn!(
				"Email worker did not stop within {:?}, aborting in-flight sends",
				self.inner.settings.shutdown_timeout
			);
			loops.abort_all();
			while loops.join_next().await.is_some() {}
		}

		self.control.lock().state = WorkerState::Stopped;
		info!("Email worker stopped");
		Ok(())
	}

	/// Run a single dispatch cycle outside the loops. Returns the number of items handled.
	pub async fn run_once(&self) -> ClResult<usize> {
		self.inner.dispatch_cycle().await
	}

	/// Run a single cleanup pass outside the loops. Returns the number of deleted items.
	pub async fn cleanup_once(&self) -> ClResult<u64> {
		self.inner.cleanup_cycle().await
	}
}

impl Drop for EmailWorker {
	fn drop(&mut self) {
		if let Some(cancel) = self.control.get_mut().cancel.take() {
			cancel.cancel();
		}
	}
}


// vim: ts=4
