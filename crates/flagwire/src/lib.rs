// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Feature flag client SDK for flagwire.
//!
//! The client fetches evaluated flags for one context at a time, keeps them in
//! memory for synchronous lookups, and records analytics events about how they
//! were used.
//!
//! # Features
//!
//! - **Fast evaluation**: `variation` is an in-memory lookup
//! - **Live updates**: a server-sent event stream patches the table while
//!   change listeners are registered
//! - **Persistence**: optional per-context flag tables in the host's key-value store
//! - **Analytics**: feature, custom and identify events with summaries,
//!   sampling, deduplication and private attribute redaction
//! - **Pluggable host**: HTTP, streaming and storage are injected through
//!   [`Platform`]
//!
//! # Example
//!
//! ```ignore
//! use flagwire::{ClientEvent, EvaluationContext, FlagsClient, CHANGE};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = FlagsClient::builder()
//!         .environment("env-123")
//!         .context(EvaluationContext::new("user-42").with_email("ann@example.com"))
//!         .evaluation_reasons(true)
//!         .build()
//!         .await?;
//!
//!     client.on(CHANGE, |event: &ClientEvent| println!("flags changed: {event:?}"));
//!
//!     let detail = client.variation_detail("new-checkout", json!(false));
//!     client.track("checkout-started", None, None);
//!
//!     client.identify(EvaluationContext::new("user-43"), None).await?;
//!     client.close().await;
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod emitter;
mod identity;
mod persistence;
mod platform;
mod requestor;
mod store;
mod stream;

pub use client::{FlagsClient, FlagsClientBuilder};
pub use config::{
	ClientConfig, DEFAULT_BASE_URL, DEFAULT_EVENTS_URL, DEFAULT_EVENT_CAPACITY,
	DEFAULT_STREAM_RECONNECT_DELAY, DEFAULT_STREAM_URL,
};
pub use emitter::{
	change_event_for, ClientEvent, Listener, ListenerId, CHANGE, CHANGE_PREFIX, ERROR, FAILED,
	INITIALIZED, READY,
};
pub use identity::{IdentityManager, ANONYMOUS_KEY_STORE_KEY};
pub use persistence::PersistentFlagCache;
pub use platform::{default_platform, MemoryStore, ReqwestHttp, ReqwestImageLoader, ReqwestStream};
pub use requestor::{RequestCoalescer, Requestor};
pub use store::FlagStore;
pub use stream::{LiveChannel, MessageHandler, ReadyState, StreamConfig};

// Re-export core types for convenience
pub use flagwire_core::{
	ChangeSet, EvaluationContext, EvaluationDetail, EvaluationReason, FlagChange, FlagDescriptor,
	FlagTable, FlagValues, FlagsError, Goal, KeyValueStore, Platform, PlatformError, Probes, Result,
};
