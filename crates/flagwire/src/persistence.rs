// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-context flag tables in the platform key-value store.

use std::sync::Arc;

use flagwire_core::format::{decode_cache_blob, encode_cache_blob};
use flagwire_core::{EvaluationContext, FlagTable, KeyValueStore};
use tracing::{debug, warn};

/// Saves and restores the flag table for each context.
///
/// Storage failures never propagate; they are logged and treated as a miss.
#[derive(Clone)]
pub struct PersistentFlagCache {
	store: Arc<dyn KeyValueStore>,
	environment: String,
}

impl std::fmt::Debug for PersistentFlagCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PersistentFlagCache")
			.field("environment", &self.environment)
			.finish_non_exhaustive()
	}
}

impl PersistentFlagCache {
	pub fn new(store: Arc<dyn KeyValueStore>, environment: impl Into<String>) -> Self {
		Self {
			store,
			environment: environment.into(),
		}
	}

	pub fn key_for(&self, context: &EvaluationContext) -> String {
		format!("flagwire:{}:{}", self.environment, context.fingerprint())
	}

	pub async fn load(&self, context: &EvaluationContext) -> Option<FlagTable> {
		let key = self.key_for(context);
		let blob = match self.store.get(&key).await {
			Ok(Some(blob)) => blob,
			Ok(None) => return None,
			Err(e) => {
				warn!(error = %e, "Failed to read cached flags");
				return None;
			}
		};
		match decode_cache_blob(&blob) {
			Ok(table) => {
				debug!(flags = table.len(), "Loaded cached flags");
				Some(table)
			}
			Err(e) => {
				warn!(error = %e, "Ignoring unreadable cached flags");
				None
			}
		}
	}

	pub async fn save(&self, context: &EvaluationContext, table: &FlagTable) {
		let blob = match encode_cache_blob(table) {
			Ok(blob) => blob,
			Err(e) => {
				warn!(error = %e, "Failed to encode flags for caching");
				return;
			}
		};
		if let Err(e) = self.store.set(&self.key_for(context), &blob).await {
			warn!(error = %e, "Failed to cache flags");
		}
	}

	pub async fn clear(&self, context: &EvaluationContext) {
		if let Err(e) = self.store.clear(&self.key_for(context)).await {
			warn!(error = %e, "Failed to clear cached flags");
		}
	}
}
