// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Named client notifications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flagwire_core::{ChangeSet, FlagsError};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::error;

pub const READY: &str = "ready";
pub const INITIALIZED: &str = "initialized";
pub const FAILED: &str = "failed";
pub const ERROR: &str = "error";
pub const CHANGE: &str = "change";

/// Prefix of the per-flag change notification, `change:<flag key>`.
pub const CHANGE_PREFIX: &str = "change:";

/// Payload delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
	Ready,
	Initialized,
	Failed(FlagsError),
	Error(FlagsError),
	/// Every change from one mutation, keyed by flag.
	Change(ChangeSet),
	/// A single flag changed; `current` is `Null` after a deletion.
	FlagChanged {
		key: String,
		current: Value,
		previous: Option<Value>,
	},
}

pub type Listener = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Handle returned by [`Emitter::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub fn change_event_for(key: &str) -> String {
	format!("{CHANGE_PREFIX}{key}")
}

pub fn is_change_event(name: &str) -> bool {
	name == CHANGE || name.starts_with(CHANGE_PREFIX)
}

#[derive(Default)]
pub struct Emitter {
	listeners: Mutex<HashMap<String, Vec<(ListenerId, Listener)>>>,
	next_id: AtomicU64,
}

impl std::fmt::Debug for Emitter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let listeners = self.listeners.lock();
		f.debug_struct("Emitter")
			.field("events", &listeners.keys().collect::<Vec<_>>())
			.finish()
	}
}

impl Emitter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn on(&self, event: &str, listener: Listener) -> ListenerId {
		let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
		self.listeners
			.lock()
			.entry(event.to_string())
			.or_default()
			.push((id, listener));
		id
	}

	/// Returns whether the listener was registered.
	pub fn off(&self, event: &str, id: ListenerId) -> bool {
		let mut listeners = self.listeners.lock();
		let Some(registered) = listeners.get_mut(event) else {
			return false;
		};
		let before = registered.len();
		registered.retain(|(existing, _)| *existing != id);
		let removed = registered.len() != before;
		if registered.is_empty() {
			listeners.remove(event);
		}
		removed
	}

	/// Calls every listener for `event` in registration order.
	///
	/// Listeners run outside the registry lock, so they may register or
	/// remove listeners themselves.
	pub fn emit(&self, event: &str, payload: &ClientEvent) {
		let listeners: Vec<Listener> = match self.listeners.lock().get(event) {
			Some(registered) => registered.iter().map(|(_, l)| Arc::clone(l)).collect(),
			None => return,
		};
		for listener in listeners {
			listener(payload);
		}
	}

	pub fn listener_count(&self, event: &str) -> usize {
		self.listeners.lock().get(event).map_or(0, Vec::len)
	}

	pub fn has_change_listeners(&self) -> bool {
		self.listeners
			.lock()
			.iter()
			.any(|(name, registered)| is_change_event(name) && !registered.is_empty())
	}

	/// Delivers `error` to `error` listeners, or logs it when there are none.
	pub fn maybe_report_error(&self, err: FlagsError) {
		if self.listener_count(ERROR) > 0 {
			self.emit(ERROR, &ClientEvent::Error(err));
		} else {
			error!(error = %err, "Unhandled flags client error");
		}
	}
}
