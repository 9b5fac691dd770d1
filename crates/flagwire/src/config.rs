// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client configuration.

use std::str::FromStr;
use std::time::Duration;

use flagwire_core::FlagsError;
use flagwire_events::{ProcessorConfig, MIN_FLUSH_INTERVAL};
use serde_json::{Map, Value};
use tracing::warn;

pub const DEFAULT_BASE_URL: &str = "https://app.flagwire.dev";
pub const DEFAULT_EVENTS_URL: &str = "https://events.flagwire.dev";
pub const DEFAULT_STREAM_URL: &str = "https://stream.flagwire.dev";

pub const DEFAULT_EVENT_CAPACITY: usize = 100;
pub const DEFAULT_STREAM_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Configuration for the flags client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Base URL for flag and goal fetches.
	pub base_url: String,
	/// Base URL for analytics delivery.
	pub events_url: String,
	/// Base URL for the live update stream.
	pub stream_url: String,
	/// Send the context as a REPORT body instead of encoding it into the URL.
	pub use_report: bool,
	/// Ask the service to include evaluation reasons.
	pub evaluation_reasons: bool,
	/// Record and deliver analytics events at all.
	pub send_events: bool,
	pub all_attributes_private: bool,
	pub private_attribute_names: Vec<String>,
	pub inline_users_in_events: bool,
	/// Disable the five-minute suppression of identical feature events.
	pub allow_frequent_duplicate_events: bool,
	/// Only `variation` calls produce feature events; `all_flags` and
	/// change handling do not.
	pub send_events_only_for_variation: bool,
	pub flush_interval: Duration,
	/// Keep one in this many detailed events; 0 keeps all.
	pub sampling_interval: u32,
	pub event_capacity: usize,
	pub stream_reconnect_delay: Duration,
	/// `Some` forces streaming on or off; `None` streams while change
	/// listeners are registered.
	pub streaming: Option<bool>,
	/// Persist flag tables per context in the platform key-value store.
	pub persist_flags: bool,
	/// Server-rendered flag state to start from instead of fetching.
	pub bootstrap: Option<Map<String, Value>>,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			base_url: DEFAULT_BASE_URL.to_string(),
			events_url: DEFAULT_EVENTS_URL.to_string(),
			stream_url: DEFAULT_STREAM_URL.to_string(),
			use_report: false,
			evaluation_reasons: false,
			send_events: true,
			all_attributes_private: false,
			private_attribute_names: Vec::new(),
			inline_users_in_events: false,
			allow_frequent_duplicate_events: false,
			send_events_only_for_variation: false,
			flush_interval: MIN_FLUSH_INTERVAL,
			sampling_interval: 0,
			event_capacity: DEFAULT_EVENT_CAPACITY,
			stream_reconnect_delay: DEFAULT_STREAM_RECONNECT_DELAY,
			streaming: None,
			persist_flags: false,
			bootstrap: None,
		}
	}
}

impl ClientConfig {
	/// Corrects out-of-range options.
	///
	/// Returns the usable configuration together with one error per option
	/// that had to be replaced.
	pub fn validate(mut self) -> (Self, Vec<FlagsError>) {
		let mut errors = Vec::new();

		for url in [&mut self.base_url, &mut self.events_url, &mut self.stream_url] {
			let trimmed = url.trim_end_matches('/').len();
			url.truncate(trimmed);
		}

		if self.flush_interval < MIN_FLUSH_INTERVAL {
			errors.push(FlagsError::InvalidArgument(format!(
				"flush interval of {}ms is too short; using {}ms",
				self.flush_interval.as_millis(),
				MIN_FLUSH_INTERVAL.as_millis()
			)));
			self.flush_interval = MIN_FLUSH_INTERVAL;
		}
		if self.event_capacity == 0 {
			errors.push(FlagsError::InvalidArgument(format!(
				"event capacity must be positive; using {DEFAULT_EVENT_CAPACITY}"
			)));
			self.event_capacity = DEFAULT_EVENT_CAPACITY;
		}
		if self.stream_reconnect_delay.is_zero() {
			errors.push(FlagsError::InvalidArgument(format!(
				"stream reconnect delay must be positive; using {}ms",
				DEFAULT_STREAM_RECONNECT_DELAY.as_millis()
			)));
			self.stream_reconnect_delay = DEFAULT_STREAM_RECONNECT_DELAY;
		}

		for error in &errors {
			warn!(error = %error, "Corrected client configuration");
		}
		(self, errors)
	}

	/// Overlays `FLAGWIRE_*` environment variables.
	pub fn apply_env(&mut self) -> Vec<FlagsError> {
		self.apply_env_from(|name| std::env::var(name).ok())
	}

	/// Overlays variables resolved through `lookup`.
	///
	/// Unparseable values are reported and leave the option unchanged.
	pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<FlagsError> {
		let mut env = EnvReader {
			lookup: &lookup,
			errors: Vec::new(),
		};

		if let Some(v) = env.string("FLAGWIRE_BASE_URL") {
			self.base_url = v;
		}
		if let Some(v) = env.string("FLAGWIRE_EVENTS_URL") {
			self.events_url = v;
		}
		if let Some(v) = env.string("FLAGWIRE_STREAM_URL") {
			self.stream_url = v;
		}
		if let Some(v) = env.parsed::<u64>("FLAGWIRE_FLUSH_INTERVAL_MS") {
			self.flush_interval = Duration::from_millis(v);
		}
		if let Some(v) = env.parsed::<u32>("FLAGWIRE_SAMPLING_INTERVAL") {
			self.sampling_interval = v;
		}
		if let Some(v) = env.parsed::<usize>("FLAGWIRE_EVENT_CAPACITY") {
			self.event_capacity = v;
		}
		if let Some(v) = env.boolean("FLAGWIRE_SEND_EVENTS") {
			self.send_events = v;
		}
		if let Some(v) = env.boolean("FLAGWIRE_USE_REPORT") {
			self.use_report = v;
		}
		if let Some(v) = env.boolean("FLAGWIRE_EVALUATION_REASONS") {
			self.evaluation_reasons = v;
		}

		env.errors
	}

	pub(crate) fn processor_config(&self) -> ProcessorConfig {
		ProcessorConfig {
			flush_interval: self.flush_interval,
			sampling_interval: self.sampling_interval,
			event_capacity: self.event_capacity,
			inline_users_in_events: self.inline_users_in_events,
			all_attributes_private: self.all_attributes_private,
			private_attribute_names: self.private_attribute_names.clone(),
		}
	}
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
	lookup: &'a F,
	errors: Vec<FlagsError>,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
	fn string(&self, name: &str) -> Option<String> {
		(self.lookup)(name).filter(|s| !s.is_empty())
	}

	fn parsed<T: FromStr>(&mut self, name: &str) -> Option<T> {
		let raw = self.string(name)?;
		match raw.parse() {
			Ok(v) => Some(v),
			Err(_) => {
				self.reject(name, &raw);
				None
			}
		}
	}

	fn boolean(&mut self, name: &str) -> Option<bool> {
		let raw = self.string(name)?;
		match raw.to_ascii_lowercase().as_str() {
			"true" | "1" => Some(true),
			"false" | "0" => Some(false),
			_ => {
				self.reject(name, &raw);
				None
			}
		}
	}

	fn reject(&mut self, name: &str, raw: &str) {
		self.errors.push(FlagsError::InvalidArgument(format!(
			"{name} has unparseable value '{raw}'"
		)));
	}
}
