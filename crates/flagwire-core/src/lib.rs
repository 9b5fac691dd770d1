// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the flagwire feature flag client.
//!
//! This crate holds everything the other flagwire crates share:
//!
//! - [`EvaluationContext`] - the subject flags are evaluated for
//! - [`FlagDescriptor`] and [`FlagTable`] - stored flag state
//! - [`ChangeSet`] - per-key diffs produced by table mutations
//! - analytics event shapes in [`event`]
//! - live stream messages in [`stream`]
//! - host capabilities in [`platform`]
//! - [`FlagsError`]

pub mod change;
pub mod context;
pub mod error;
pub mod event;
pub mod flag;
pub mod format;
pub mod goal;
pub mod platform;
pub mod stream;

pub use change::{diff_tables, ChangeSet, FlagChange};
pub use context::EvaluationContext;
pub use error::{FlagsError, PlatformError, Result};
pub use event::{AnalyticsEvent, CustomEvent, FeatureEvent, IdentifyEvent, OutputEvent};
pub use flag::{
	ErrorKind, EvaluationDetail, EvaluationReason, FlagDescriptor, FlagTable, FlagValues,
};
pub use goal::Goal;
pub use platform::{
	HttpMethod, HttpRequest, HttpResponse, HttpTransport, ImageLoader, KeyValueStore,
	PendingResponse, Platform, Probes, StreamTransport, SystemProbes,
};
pub use stream::StreamMessage;
