// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types shared by every flagwire crate.

use thiserror::Error;

/// Result type alias for flagwire operations.
pub type Result<T> = std::result::Result<T, FlagsError>;

/// Errors surfaced by the flag client.
///
/// The type is `Clone` because a single fetch failure may be delivered to
/// several coalesced waiters and to the error channel at the same time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlagsError {
	/// The context has no usable key.
	#[error("invalid context: {0}")]
	InvalidContext(String),

	/// The flag or goal endpoint answered 404.
	#[error("environment not found; double-check that the environment id is correct")]
	EnvironmentNotFound,

	/// Fetching flag settings failed.
	#[error("error fetching flag settings: {message}")]
	FlagFetch {
		/// HTTP status, absent for transport-level failures.
		status: Option<u16>,
		/// Human-readable cause.
		message: String,
	},

	/// A configuration value was rejected.
	#[error("invalid argument: {0}")]
	InvalidArgument(String),

	/// A custom event key was not a usable string.
	#[error("custom event key must be a non-empty string, got {0:?}")]
	InvalidEventKey(String),

	/// The server answered with something we could not interpret.
	#[error("unexpected response: {0}")]
	UnexpectedResponse(String),

	/// The live update stream failed.
	#[error("stream error: {0}")]
	Stream(String),

	/// The persistent cache could not be read or written.
	#[error("storage unavailable: {0}")]
	Storage(String),

	/// The client has been closed.
	#[error("client has been closed")]
	ClientClosed,
}

impl FlagsError {
	/// Wraps a transport failure that happened before any response arrived.
	pub fn network(cause: impl std::fmt::Display) -> Self {
		FlagsError::FlagFetch {
			status: None,
			message: format!("network error ({cause})"),
		}
	}

	/// Builds the error for an HTTP status returned while fetching.
	pub fn from_fetch_status(status: u16, text: &str) -> Self {
		if status == 404 {
			return FlagsError::EnvironmentNotFound;
		}
		let message = if text.is_empty() {
			status.to_string()
		} else {
			format!("{status} {text}")
		};
		FlagsError::FlagFetch {
			status: Some(status),
			message,
		}
	}
}

/// Failures reported by injected platform capabilities.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
	/// The request never produced a response.
	#[error("network error: {0}")]
	Network(String),

	/// The request was cancelled before it completed.
	#[error("request cancelled")]
	Cancelled,

	/// The key-value store failed.
	#[error("storage error: {0}")]
	Storage(String),

	/// The capability is not provided by this platform.
	#[error("capability not available: {0}")]
	Unsupported(&'static str),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn not_found_maps_to_environment_error() {
		assert_eq!(
			FlagsError::from_fetch_status(404, "Not Found"),
			FlagsError::EnvironmentNotFound
		);
	}

	#[test]
	fn other_statuses_keep_status_and_text() {
		let err = FlagsError::from_fetch_status(503, "Service Unavailable");
		assert_eq!(
			err,
			FlagsError::FlagFetch {
				status: Some(503),
				message: "503 Service Unavailable".to_string(),
			}
		);
	}

	#[test]
	fn network_errors_have_no_status() {
		let err = FlagsError::network(PlatformError::Network("connection refused".into()));
		match err {
			FlagsError::FlagFetch { status, message } => {
				assert!(status.is_none());
				assert!(message.contains("connection refused"));
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}
}
