// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Delivery of event batches to the events endpoint.
//!
//! Batches are POSTed as JSON when the host allows it. Otherwise they are split
//! into URL-sized chunks and delivered as image loads, one GET per chunk.

use async_trait::async_trait;
use flagwire_common_http::{base64url, is_http_error_recoverable, retry, RetryConfig, RetryableError};
use flagwire_core::platform::{HttpMethod, HttpRequest, HttpResponse};
use flagwire_core::{OutputEvent, Platform, PlatformError};
use futures::future::join_all;
use tracing::{debug, warn};

use crate::error::{EventsError, Result};

/// Practical ceiling on the length of an image request URL.
pub const MAX_URL_LENGTH: usize = 2000;

/// Version of the event payload format.
pub const EVENT_SCHEMA_VERSION: &str = "3";

pub const EVENT_SCHEMA_HEADER: &str = "X-Flagwire-Event-Schema";
pub const PAYLOAD_ID_HEADER: &str = "X-Flagwire-Payload-ID";

/// What the events endpoint answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
	pub status: u16,
	/// Server clock from the `Date` header, in epoch millis.
	pub server_time: Option<i64>,
}

impl SendOutcome {
	fn from_response(response: &HttpResponse) -> Self {
		let server_time = response
			.header("date")
			.and_then(|date| chrono::DateTime::parse_from_rfc2822(date).ok())
			.map(|date| date.timestamp_millis());
		Self {
			status: response.status,
			server_time,
		}
	}
}

/// Handler for delivering batched events.
#[async_trait]
pub trait BatchSender: Send + Sync {
	/// Sends one batch.
	///
	/// Returns `Ok(None)` when the transport exposes no response, which is
	/// the case for image delivery and for `sync` sends.
	async fn send_batch(&self, events: Vec<OutputEvent>, sync: bool) -> Result<Option<SendOutcome>>;
}

/// One POST attempt that may be repeated.
#[derive(Debug)]
enum AttemptError {
	Status(HttpResponse),
	Network(PlatformError),
}

impl RetryableError for AttemptError {
	fn is_retryable(&self) -> bool {
		match self {
			AttemptError::Status(response) => is_http_error_recoverable(response.status),
			AttemptError::Network(PlatformError::Cancelled) => false,
			AttemptError::Network(_) => true,
		}
	}
}

/// [`BatchSender`] built on the host's HTTP and image capabilities.
pub struct EventSender {
	platform: Platform,
	post_url: String,
	image_url: String,
	user_agent: String,
	retry_config: RetryConfig,
}

impl EventSender {
	/// `events_url` is the base of the events service, e.g. `https://events.example.com`.
	pub fn new(platform: Platform, events_url: &str, environment: &str) -> Self {
		let events_url = events_url.trim_end_matches('/');
		Self {
			platform,
			post_url: format!("{events_url}/events/bulk/{environment}"),
			image_url: format!("{events_url}/a/{environment}.gif"),
			user_agent: flagwire_common_http::user_agent(),
			retry_config: RetryConfig::single_retry(),
		}
	}

	pub fn post_url(&self) -> &str {
		&self.post_url
	}

	pub fn image_url(&self) -> &str {
		&self.image_url
	}

	async fn post(&self, body: String, sync: bool) -> Result<Option<SendOutcome>> {
		let Some(http) = self.platform.http().cloned() else {
			return Ok(None);
		};
		let payload_id = uuid::Uuid::new_v4().to_string();
		let request = HttpRequest::get(self.post_url.clone())
			.with_method(HttpMethod::Post)
			.with_header("Content-Type", "application/json")
			.with_header(EVENT_SCHEMA_HEADER, EVENT_SCHEMA_VERSION)
			.with_header(PAYLOAD_ID_HEADER, payload_id)
			.with_header("User-Agent", self.user_agent.clone())
			.with_body(body);

		if sync {
			let pending = http.request(request);
			tokio::spawn(async move {
				if let Err(e) = pending.response.await {
					debug!(error = %e, "synchronous event post failed");
				}
			});
			return Ok(None);
		}

		let result = retry(&self.retry_config, || {
			let pending = http.request(request.clone());
			async move {
				let response = pending.response.await.map_err(AttemptError::Network)?;
				if response.status >= 400 && is_http_error_recoverable(response.status) {
					return Err(AttemptError::Status(response));
				}
				Ok(response)
			}
		})
		.await;

		match result {
			Ok(response) | Err(AttemptError::Status(response)) => {
				Ok(Some(SendOutcome::from_response(&response)))
			}
			Err(AttemptError::Network(e)) => Err(EventsError::Network(e.to_string())),
		}
	}

	async fn load_images(&self, events: &[OutputEvent], sync: bool) -> Result<Option<SendOutcome>> {
		let Some(loader) = self.platform.image_loader().cloned() else {
			debug!("no image loader available; dropping events");
			return Ok(None);
		};

		let prefix = format!("{}?d=", self.image_url);
		// The array brackets add up to two encoded characters beyond the chunk budget.
		let budget = MAX_URL_LENGTH.saturating_sub(prefix.len() + 2);
		let mut loads = Vec::new();
		for chunk in chunk_events_for_url(budget, events)? {
			let body = serde_json::to_string(&chunk)?;
			let url = format!("{prefix}{}", base64url(&body));
			loads.push(loader.load(&url));
		}

		if sync {
			for load in loads {
				tokio::spawn(load);
			}
			return Ok(None);
		}

		let failed = join_all(loads).await.into_iter().filter(|ok| !ok).count();
		if failed > 0 {
			warn!(failed, "some event image requests failed to load");
		}
		Ok(None)
	}
}

#[async_trait]
impl BatchSender for EventSender {
	async fn send_batch(&self, events: Vec<OutputEvent>, sync: bool) -> Result<Option<SendOutcome>> {
		if self.platform.http().is_none() {
			return Ok(None);
		}

		debug!(url = %self.post_url, count = events.len(), sync, "Sending event batch");

		if self.platform.has_cross_origin_post() {
			let body = serde_json::to_string(&events)?;
			self.post(body, sync).await
		} else {
			self.load_images(&events, sync).await
		}
	}
}

/// Splits `events` into order-preserving chunks whose per-event encoded sizes
/// sum to at most `max_length`.
///
/// An event's size counts its separator in the JSON array, so a chunk's
/// encoded array is at most two characters longer than the sum. An event
/// that alone exceeds the budget still gets a chunk of its own.
pub fn chunk_events_for_url<'a>(
	max_length: usize,
	events: &'a [OutputEvent],
) -> std::result::Result<Vec<&'a [OutputEvent]>, serde_json::Error> {
	let mut chunks = Vec::new();
	let mut start = 0;
	let mut remaining = max_length as i64;

	for (index, event) in events.iter().enumerate() {
		let size = encoded_event_len(event)? as i64;
		if remaining - size < 0 && index > start {
			chunks.push(&events[start..index]);
			start = index;
			remaining = max_length as i64;
		}
		remaining -= size;
		if remaining <= 0 {
			chunks.push(&events[start..=index]);
			start = index + 1;
			remaining = max_length as i64;
		}
	}
	if start < events.len() {
		chunks.push(&events[start..]);
	}

	Ok(chunks)
}

/// Base64url length of `event` plus its array separator.
pub fn encoded_event_len(event: &OutputEvent) -> std::result::Result<usize, serde_json::Error> {
	let raw = serde_json::to_string(event)?.len() + 1;
	Ok((raw * 4).div_ceil(3))
}


#[cfg(test)]
mod proptests {
	use super::*;
	use flagwire_core::event::CustomOutput;
	use proptest::prelude::*;

	fn encoded_len(event: &OutputEvent) -> usize {
		encoded_event_len(event).unwrap()
	}

	proptest! {
		#[test]
		fn chunks_preserve_order_and_respect_budget(
			keys in prop::collection::vec("[a-z]{1,40}", 1..80),
			budget in 200usize..1900,
		) {
			let events: Vec<OutputEvent> = keys
				.iter()
				.enumerate()
				.map(|(i, key)| OutputEvent::Custom(CustomOutput {
					creation_date: i as i64,
					key: key.clone(),
					user: None,
					user_key: Some("u".into()),
					data: None,
					metric_value: None,
					url: None,
				}))
				.collect();

			let chunks = chunk_events_for_url(budget, &events).unwrap();
			let flattened: Vec<OutputEvent> = chunks.iter().flat_map(|c| c.iter().cloned()).collect();
			prop_assert_eq!(&flattened, &events);

			for chunk in &chunks {
				prop_assert!(!chunk.is_empty());
				let size: usize = chunk.iter().map(encoded_len).sum();
				prop_assert!(size <= budget || chunk.len() == 1);
				if chunk.len() > 1 {
					let array = base64url(&serde_json::to_string(chunk).unwrap()).len();
					prop_assert!(array <= budget + 2);
				}
			}
		}
	}
}
