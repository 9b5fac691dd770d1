// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Shared HTTP utilities for flagwire.
//!
//! This crate provides:
//! - A pre-configured HTTP client builder with the SDK User-Agent header
//! - Classification of recoverable HTTP statuses
//! - Retry logic for transient failures
//! - The URL-safe base64 encoding used for contexts and image payloads

mod client;
mod encoding;
mod retry;
mod status;

pub use client::{builder, builder_with_user_agent, user_agent, SDK_NAME, SDK_VERSION};
pub use encoding::base64url;
pub use retry::{retry, RetryConfig, RetryableError};
pub use status::is_http_error_recoverable;
