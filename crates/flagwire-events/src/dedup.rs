// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Suppression of repeated identical feature events.

use std::collections::HashMap;

use serde_json::Value;

/// How long an evaluation result suppresses identical events.
pub const DEDUP_TTL_MILLIS: i64 = 5 * 60 * 1000;

/// Remembers when each (value, context, flag) combination was last reported.
///
/// Expired entries are replaced when looked up. Recording also sweeps the
/// whole map once per TTL, so it only holds combinations seen within the
/// last two TTLs no matter how often events are flushed.
#[derive(Debug)]
pub struct DedupCache {
	ttl_millis: i64,
	seen: HashMap<String, i64>,
	last_sweep: Option<i64>,
}

impl Default for DedupCache {
	fn default() -> Self {
		Self::new(DEDUP_TTL_MILLIS)
	}
}

impl DedupCache {
	pub fn new(ttl_millis: i64) -> Self {
		Self {
			ttl_millis,
			seen: HashMap::new(),
			last_sweep: None,
		}
	}

	pub fn cache_key(value: &Value, context_key: &str, flag_key: &str) -> String {
		format!("{value}{context_key}{flag_key}")
	}

	/// Returns true and records `now` if no identical event was reported
	/// within the TTL.
	pub fn check_and_record(&mut self, key: String, now: i64) -> bool {
		let ttl = self.ttl_millis;
		match self.last_sweep.map(|last| now - last >= ttl) {
			Some(true) => self.sweep(now),
			Some(false) => {}
			None => self.last_sweep = Some(now),
		}
		if let Some(&last) = self.seen.get(&key) {
			if now - last < self.ttl_millis {
				return false;
			}
		}
		self.seen.insert(key, now);
		true
	}

	/// Drops every entry older than the TTL.
	pub fn sweep(&mut self, now: i64) {
		let ttl = self.ttl_millis;
		self.seen.retain(|_, last| now - *last < ttl);
		self.last_sweep = Some(now);
	}

	pub fn len(&self) -> usize {
		self.seen.len()
	}

	pub fn is_empty(&self) -> bool {
		self.seen.is_empty()
	}
}
