// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The analytics event queue and its periodic flush.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use flagwire_common_http::is_http_error_recoverable;
use flagwire_core::event::{CustomOutput, FeatureOutput, IdentifyOutput};
use flagwire_core::{AnalyticsEvent, EvaluationContext, FeatureEvent, FlagsError, OutputEvent, Probes};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ErrorReporter;
use crate::privacy::ContextFilter;
use crate::sender::{BatchSender, SendOutcome};
use crate::summarizer::EventSummarizer;

/// Smallest flush interval the processor accepts.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(2000);

/// Configuration for the event queue.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
	/// Interval between automatic flushes.
	pub flush_interval: Duration,
	/// Keep one in this many detailed events; 0 keeps all.
	pub sampling_interval: u32,
	/// Maximum number of queued events before new ones are dropped.
	pub event_capacity: usize,
	/// Embed the filtered context in feature and custom events instead of its key.
	pub inline_users_in_events: bool,
	pub all_attributes_private: bool,
	pub private_attribute_names: Vec<String>,
}

impl Default for ProcessorConfig {
	fn default() -> Self {
		Self {
			flush_interval: MIN_FLUSH_INTERVAL,
			sampling_interval: 0,
			event_capacity: 100,
			inline_users_in_events: false,
			all_attributes_private: false,
			private_attribute_names: Vec::new(),
		}
	}
}

#[derive(Debug, Default)]
struct QueueState {
	queue: Vec<OutputEvent>,
	summarizer: EventSummarizer,
	exceeded_capacity: bool,
	last_known_past_time: i64,
}

impl QueueState {
	fn push(&mut self, event: OutputEvent, capacity: usize) {
		if self.queue.len() < capacity {
			self.queue.push(event);
			self.exceeded_capacity = false;
		} else if !self.exceeded_capacity {
			self.exceeded_capacity = true;
			warn!(
				capacity,
				"Exceeded event queue capacity; increase capacity to avoid dropping events"
			);
		}
	}
}

/// Buffers, samples and summarizes events, and hands batches to a [`BatchSender`].
pub struct EventProcessor {
	config: ProcessorConfig,
	filter: ContextFilter,
	sender: Arc<dyn BatchSender>,
	probes: Arc<dyn Probes>,
	report: ErrorReporter,
	state: Mutex<QueueState>,
	disabled: AtomicBool,
	timer: Mutex<Option<(mpsc::Sender<()>, JoinHandle<()>)>>,
}

impl EventProcessor {
	pub fn new(
		config: ProcessorConfig,
		sender: Arc<dyn BatchSender>,
		probes: Arc<dyn Probes>,
		report: ErrorReporter,
	) -> Self {
		let filter = ContextFilter::new(
			config.all_attributes_private,
			config.private_attribute_names.clone(),
		);
		Self {
			config,
			filter,
			sender,
			probes,
			report,
			state: Mutex::new(QueueState::default()),
			disabled: AtomicBool::new(false),
			timer: Mutex::new(None),
		}
	}

	/// Records an event.
	///
	/// Feature events always feed the summary. The detailed copy, and any
	/// debug copy, only survive sampling.
	pub fn enqueue(&self, event: AnalyticsEvent) {
		if self.is_disabled() {
			return;
		}
		let now = self.probes.now_millis();
		let capacity = self.config.event_capacity;
		let mut state = self.state.lock();

		match event {
			AnalyticsEvent::Feature(feature) => {
				state.summarizer.summarize_event(&feature);
				if !self.should_sample() {
					return;
				}
				let add_debug = should_debug(&feature, state.last_known_past_time, now);
				if feature.track_events {
					let output = self.feature_output(&feature, self.config.inline_users_in_events);
					state.push(OutputEvent::Feature(output), capacity);
				}
				if add_debug {
					state.push(OutputEvent::Debug(self.feature_output(&feature, true)), capacity);
				}
			}
			AnalyticsEvent::Identify(identify) => {
				if self.should_sample() {
					let output = OutputEvent::Identify(IdentifyOutput {
						creation_date: identify.creation_date,
						key: identify.context.key_or_empty().to_string(),
						user: self.filter.filter(&identify.context),
					});
					state.push(output, capacity);
				}
			}
			AnalyticsEvent::Custom(custom) => {
				if self.should_sample() {
					let (user, user_key) =
						self.context_fields(&custom.context, self.config.inline_users_in_events);
					let output = OutputEvent::Custom(CustomOutput {
						creation_date: custom.creation_date,
						key: custom.key,
						user,
						user_key,
						data: custom.data,
						metric_value: custom.metric_value,
						url: custom.url,
					});
					state.push(output, capacity);
				}
			}
		}
	}

	/// Sends everything queued so far, plus the summary, as one batch.
	///
	/// The queue and summary are cleared before the send starts, so events
	/// recorded while it is in flight belong to the next batch.
	pub async fn flush(&self, sync: bool) {
		if self.is_disabled() {
			return;
		}

		let batch = {
			let mut state = self.state.lock();
			let mut batch = std::mem::take(&mut state.queue);
			if let Some(summary) = state.summarizer.summary() {
				batch.push(OutputEvent::Summary(summary));
			}
			state.summarizer.clear();
			batch
		};

		if batch.is_empty() {
			return;
		}

		debug!(count = batch.len(), sync, "Flushing events");
		match self.sender.send_batch(batch, sync).await {
			Ok(Some(outcome)) => self.handle_outcome(outcome),
			Ok(None) => {}
			Err(e) => {
				warn!(error = %e, "Failed to deliver events");
				(self.report)(e.into());
			}
		}
	}

	fn handle_outcome(&self, outcome: SendOutcome) {
		if let Some(server_time) = outcome.server_time {
			self.state.lock().last_known_past_time = server_time;
		}
		if !is_http_error_recoverable(outcome.status) {
			self.disabled.store(true, Ordering::SeqCst);
			warn!(
				status = outcome.status,
				"Events endpoint rejected the batch; analytics events are disabled for this client"
			);
		}
		if outcome.status >= 400 {
			(self.report)(FlagsError::UnexpectedResponse(format!(
				"received error {} for event posting - some events were dropped",
				outcome.status
			)));
		}
	}

	/// Starts the periodic flush timer. Calling it again while running is a no-op.
	pub fn start(self: &Arc<Self>) {
		let mut timer = self.timer.lock();
		if timer.is_some() {
			return;
		}

		let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
		let weak: Weak<Self> = Arc::downgrade(self);
		let interval = self.config.flush_interval;

		info!(flush_interval_ms = interval.as_millis() as u64, "Starting event processor");

		let handle = tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = tokio::time::sleep(interval) => {
						let Some(processor) = weak.upgrade() else {
							break;
						};
						processor.flush(false).await;
					}
					_ = shutdown_rx.recv() => {
						break;
					}
				}
			}
			debug!("Event flush timer stopped");
		});

		*timer = Some((shutdown_tx, handle));
	}

	/// Stops the periodic flush timer. Queued events stay queued.
	pub fn stop(&self) {
		if let Some((shutdown_tx, _handle)) = self.timer.lock().take() {
			let _ = shutdown_tx.try_send(());
		}
	}

	/// True once the events endpoint has rejected a batch with an unrecoverable status.
	pub fn is_disabled(&self) -> bool {
		self.disabled.load(Ordering::SeqCst)
	}

	pub fn queue_len(&self) -> usize {
		self.state.lock().queue.len()
	}

	fn should_sample(&self) -> bool {
		let interval = self.config.sampling_interval;
		interval == 0 || fastrand::u32(0..interval) == 0
	}

	fn context_fields(&self, context: &EvaluationContext, inline: bool) -> (Option<Value>, Option<String>) {
		if inline {
			(Some(self.filter.filter(context)), None)
		} else {
			(None, Some(context.key_or_empty().to_string()))
		}
	}

	fn feature_output(&self, feature: &FeatureEvent, inline: bool) -> FeatureOutput {
		let (user, user_key) = self.context_fields(&feature.context, inline);
		FeatureOutput {
			creation_date: feature.creation_date,
			key: feature.key.clone(),
			user,
			user_key,
			value: feature.value.clone(),
			variation: feature.variation,
			default: feature.default.clone(),
			version: feature.version,
			reason: feature.reason.clone(),
		}
	}
}

impl Drop for EventProcessor {
	fn drop(&mut self) {
		if let Some((_, handle)) = self.timer.get_mut().take() {
			handle.abort();
		}
	}
}

/// Debug mode lasts until the earlier of the server's and the local clock's view.
fn should_debug(feature: &FeatureEvent, last_known_past_time: i64, now: i64) -> bool {
	feature
		.debug_events_until_date
		.is_some_and(|until| until > last_known_past_time && until > now)
}
