// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Ownership of the current evaluation context.

use std::sync::Arc;

use flagwire_core::{EvaluationContext, FlagsError, KeyValueStore, Result};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

/// Store key for the generated anonymous context key.
pub const ANONYMOUS_KEY_STORE_KEY: &str = "flagwire:$anonymousContextKey";

pub type ContextChangeCallback = Box<dyn Fn(&EvaluationContext) + Send + Sync>;

/// Holds the current context and hands out copies of it.
pub struct IdentityManager {
	current: RwLock<Option<EvaluationContext>>,
	store: Option<Arc<dyn KeyValueStore>>,
	generated_key: Mutex<Option<String>>,
	on_change: Option<ContextChangeCallback>,
}

impl std::fmt::Debug for IdentityManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("IdentityManager")
			.field("current", &*self.current.read())
			.field("has_store", &self.store.is_some())
			.finish()
	}
}

impl IdentityManager {
	pub fn new(store: Option<Arc<dyn KeyValueStore>>) -> Self {
		Self {
			current: RwLock::new(None),
			store,
			generated_key: Mutex::new(None),
			on_change: None,
		}
	}

	/// Registers the callback run after every successful context switch.
	pub fn with_on_change(mut self, callback: ContextChangeCallback) -> Self {
		self.on_change = Some(callback);
		self
	}

	pub fn context(&self) -> Option<EvaluationContext> {
		self.current.read().clone()
	}

	/// Returns a copy of `raw` that is safe to store.
	///
	/// Anonymous contexts without a key receive the persisted anonymous key.
	pub async fn sanitize(&self, raw: EvaluationContext) -> Result<EvaluationContext> {
		let mut context = raw;
		if context.key.is_some() {
			return Ok(context);
		}
		if !context.is_anonymous() {
			return Err(FlagsError::InvalidContext(
				"context must have a key unless it is anonymous".to_string(),
			));
		}
		context.key = Some(self.anonymous_key().await);
		Ok(context)
	}

	/// Sanitizes and stores `raw`, then notifies the change callback once.
	pub async fn set_context(&self, raw: EvaluationContext) -> Result<EvaluationContext> {
		let context = self.sanitize(raw).await?;
		*self.current.write() = Some(context.clone());
		debug!(context_key = %context.key_or_empty(), "Context updated");
		if let Some(callback) = &self.on_change {
			callback(&context);
		}
		Ok(context)
	}

	async fn anonymous_key(&self) -> String {
		if let Some(key) = self.generated_key.lock().clone() {
			return key;
		}

		if let Some(store) = &self.store {
			match store.get(ANONYMOUS_KEY_STORE_KEY).await {
				Ok(Some(key)) if !key.is_empty() => {
					*self.generated_key.lock() = Some(key.clone());
					return key;
				}
				Ok(_) => {}
				Err(e) => warn!(error = %e, "Failed to read anonymous context key"),
			}
		}

		let key = uuid::Uuid::new_v4().to_string();
		if let Some(store) = &self.store {
			if let Err(e) = store.set(ANONYMOUS_KEY_STORE_KEY, &key).await {
				warn!(error = %e, "Failed to persist anonymous context key");
			}
		}
		*self.generated_key.lock() = Some(key.clone());
		key
	}
}
