// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the event pipeline.

use std::sync::Arc;

use flagwire_core::FlagsError;
use thiserror::Error;

/// Event delivery errors.
#[derive(Debug, Error)]
pub enum EventsError {
	/// No response was received, even after the retry.
	#[error("network error: {0}")]
	Network(String),

	/// The batch could not be serialized.
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

/// Result type alias for event pipeline operations.
pub type Result<T> = std::result::Result<T, EventsError>;

/// Callback through which background failures reach the client's error channel.
pub type ErrorReporter = Arc<dyn Fn(FlagsError) + Send + Sync>;

impl From<EventsError> for FlagsError {
	fn from(err: EventsError) -> Self {
		FlagsError::UnexpectedResponse(format!("{err} while posting events; some events were dropped"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn network_error_converts_to_unexpected_response() {
		let err: FlagsError = EventsError::Network("connection reset".into()).into();
		match err {
			FlagsError::UnexpectedResponse(message) => {
				assert!(message.contains("connection reset"));
				assert!(message.contains("some events were dropped"));
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}
}
