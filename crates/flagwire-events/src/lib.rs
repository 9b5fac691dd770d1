// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Analytics event pipeline for flagwire.
//!
//! Recorded events flow through the [`EventProcessor`], which samples them,
//! folds feature evaluations into an [`EventSummarizer`], redacts private
//! context attributes with a [`ContextFilter`], and periodically hands a batch
//! to a [`BatchSender`]. The default sender, [`EventSender`], POSTs batches or
//! falls back to chunked image requests when the host cannot POST.

pub mod dedup;
pub mod error;
pub mod privacy;
pub mod processor;
pub mod sender;
pub mod summarizer;

pub use dedup::DedupCache;
pub use error::{ErrorReporter, EventsError, Result};
pub use privacy::ContextFilter;
pub use processor::{EventProcessor, ProcessorConfig, MIN_FLUSH_INTERVAL};
pub use sender::{chunk_events_for_url, encoded_event_len, BatchSender, EventSender, SendOutcome};
pub use summarizer::EventSummarizer;
