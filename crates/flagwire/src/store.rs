// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory flag table and its mutation rules.

use flagwire_core::{
	diff_tables, ChangeSet, EvaluationDetail, FlagChange, FlagDescriptor, FlagTable, FlagValues,
};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

/// Owns the current flag table.
///
/// Every mutation returns the changes it caused so the caller can notify
/// listeners, persist and record events.
#[derive(Debug, Default)]
pub struct FlagStore {
	flags: RwLock<FlagTable>,
}

impl FlagStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Swaps in a complete table and reports every value difference.
	pub fn replace_all(&self, table: FlagTable) -> ChangeSet {
		let mut flags = self.flags.write();
		let changes = diff_tables(&flags, &table);
		*flags = table;
		debug!(flags = flags.len(), changed = changes.len(), "Replaced flag table");
		changes
	}

	/// Installs a table without computing changes, used before anyone can observe it.
	pub fn load(&self, table: FlagTable) {
		*self.flags.write() = table;
	}

	/// Applies a single-flag update.
	///
	/// Returns `None` when the update is older than what the table holds.
	pub fn apply_patch(&self, key: &str, descriptor: FlagDescriptor) -> Option<ChangeSet> {
		let mut flags = self.flags.write();
		let existing = flags.get(key);
		if !FlagDescriptor::supersedes(descriptor.version, existing) {
			warn!(
				flag_key = %key,
				version = ?descriptor.version,
				current = ?existing.and_then(|d| d.version),
				"Ignoring stale flag patch"
			);
			return None;
		}

		let mut changes = ChangeSet::new();
		let previous = existing.filter(|d| d.is_live());
		match (previous, descriptor.is_live()) {
			(Some(old), true) => {
				changes.insert(key.to_string(), FlagChange::updated(old, &descriptor));
			}
			(None, true) => {
				changes.insert(key.to_string(), FlagChange::created(&descriptor));
			}
			(Some(old), false) => {
				changes.insert(key.to_string(), FlagChange::deleted(old));
			}
			(None, false) => {}
		}
		flags.insert(key.to_string(), descriptor);
		Some(changes)
	}

	/// Replaces a flag with a tombstone at `version`.
	///
	/// Returns `None` when the deletion is older than what the table holds.
	pub fn apply_delete(&self, key: &str, version: Option<u64>) -> Option<ChangeSet> {
		let mut flags = self.flags.write();
		let existing = flags.get(key);
		if !FlagDescriptor::supersedes(version, existing) {
			warn!(flag_key = %key, version = ?version, "Ignoring stale flag deletion");
			return None;
		}

		let mut changes = ChangeSet::new();
		if let Some(old) = existing.filter(|d| d.is_live()) {
			changes.insert(key.to_string(), FlagChange::deleted(old));
		}
		flags.insert(key.to_string(), FlagDescriptor::tombstone(version));
		Some(changes)
	}

	/// Looks up `key`, falling back to `default`.
	///
	/// A live flag with a null value also yields `default` but keeps its
	/// variation and reason.
	pub fn evaluate(&self, key: &str, default: Value) -> EvaluationDetail {
		match self.flags.read().get(key).filter(|d| d.is_live()) {
			Some(descriptor) => {
				let mut detail = descriptor.detail();
				if detail.value.is_null() {
					detail.value = default;
				}
				detail
			}
			None => EvaluationDetail::not_found(default),
		}
	}

	pub fn get(&self, key: &str) -> Option<FlagDescriptor> {
		self.flags.read().get(key).cloned()
	}

	/// Keys of every live flag.
	pub fn all_keys(&self) -> Vec<String> {
		self.flags
			.read()
			.iter()
			.filter(|(_, d)| d.is_live())
			.map(|(k, _)| k.clone())
			.collect()
	}

	/// Values of every live flag.
	pub fn values(&self) -> FlagValues {
		self.flags
			.read()
			.iter()
			.filter(|(_, d)| d.is_live())
			.map(|(k, d)| (k.clone(), d.value.clone()))
			.collect()
	}

	/// A copy of the table including tombstones.
	pub fn snapshot(&self) -> FlagTable {
		self.flags.read().clone()
	}

	pub fn clear(&self) {
		self.flags.write().clear();
	}

	pub fn len(&self) -> usize {
		self.flags.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.flags.read().is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use flagwire_core::{ErrorKind, EvaluationReason};
	use serde_json::json;

	fn store_with(entries: &[(&str, FlagDescriptor)]) -> FlagStore {
		let store = FlagStore::new();
		store.load(
			entries
				.iter()
				.map(|(k, d)| (k.to_string(), d.clone()))
				.collect(),
		);
		store
	}

	#[test]
	fn evaluate_returns_descriptor_details() {
		let store = store_with(&[(
			"beta",
			FlagDescriptor::new(json!("on"))
				.with_version(3)
				.with_variation(1)
				.with_reason(EvaluationReason::Fallthrough),
		)]);
		let detail = store.evaluate("beta", json!("off"));
		assert_eq!(detail.value, json!("on"));
		assert_eq!(detail.variation_index, Some(1));
		assert_eq!(detail.reason, Some(EvaluationReason::Fallthrough));
	}

	#[test]
	fn evaluate_missing_or_deleted_flag_is_not_found() {
		let store = store_with(&[("gone", FlagDescriptor::tombstone(Some(4)))]);
		for key in ["gone", "never"] {
			let detail = store.evaluate(key, json!(7));
			assert_eq!(detail.value, json!(7));
			assert_eq!(detail.variation_index, None);
			assert_eq!(
				detail.reason,
				Some(EvaluationReason::Error {
					error_kind: ErrorKind::FlagNotFound
				})
			);
		}
	}

	#[test]
	fn null_value_yields_default_but_keeps_variation() {
		let store = store_with(&[("n", FlagDescriptor::new(Value::Null).with_variation(2))]);
		let detail = store.evaluate("n", json!(false));
		assert_eq!(detail.value, json!(false));
		assert_eq!(detail.variation_index, Some(2));
	}

	#[test]
	fn replace_all_reports_differences() {
		let store = store_with(&[
			("a", FlagDescriptor::new(json!(1)).with_version(1)),
			("b", FlagDescriptor::new(json!(2)).with_version(1)),
		]);
		let changes = store.replace_all(
			[
				("a".to_string(), FlagDescriptor::new(json!(1)).with_version(2)),
				("c".to_string(), FlagDescriptor::new(json!(3)).with_version(1)),
			]
			.into_iter()
			.collect(),
		);
		assert_eq!(changes.keys().collect::<Vec<_>>(), vec!["b", "c"]);
		assert!(changes["b"].is_deletion());
		assert_eq!(changes["c"].previous, None);
		assert_eq!(store.get("a").unwrap().version, Some(2));
	}

	#[test]
	fn newer_patch_is_applied() {
		let store = store_with(&[("a", FlagDescriptor::new(json!(false)).with_version(1))]);
		let changes = store
			.apply_patch("a", FlagDescriptor::new(json!(true)).with_version(2))
			.unwrap();
		assert_eq!(changes["a"].previous, Some(json!(false)));
		assert_eq!(changes["a"].current_value(), json!(true));
		assert_eq!(store.evaluate("a", json!(null)).value, json!(true));
	}

	#[test]
	fn stale_patch_is_ignored() {
		let store = store_with(&[("a", FlagDescriptor::new(json!(false)).with_version(5))]);
		assert!(store
			.apply_patch("a", FlagDescriptor::new(json!(true)).with_version(5))
			.is_none());
		assert!(store
			.apply_patch("a", FlagDescriptor::new(json!(true)).with_version(4))
			.is_none());
		assert_eq!(store.evaluate("a", json!(null)).value, json!(false));
	}

	#[test]
	fn versionless_patch_always_applies() {
		let store = store_with(&[("a", FlagDescriptor::new(json!(1)).with_version(9))]);
		assert!(store.apply_patch("a", FlagDescriptor::new(json!(2))).is_some());
		assert_eq!(store.evaluate("a", json!(null)).value, json!(2));
	}

	#[test]
	fn patch_over_tombstone_is_a_creation() {
		let store = store_with(&[("a", FlagDescriptor::tombstone(Some(3)))]);
		let changes = store
			.apply_patch("a", FlagDescriptor::new(json!("x")).with_version(4))
			.unwrap();
		assert_eq!(changes["a"].previous, None);
		assert!(!changes["a"].is_deletion());
	}

	#[test]
	fn delete_leaves_versioned_tombstone() {
		let store = store_with(&[("a", FlagDescriptor::new(json!(true)).with_version(2))]);
		let changes = store.apply_delete("a", Some(3)).unwrap();
		assert!(changes["a"].is_deletion());
		assert_eq!(changes["a"].previous, Some(json!(true)));

		let tombstone = store.get("a").unwrap();
		assert!(tombstone.deleted);
		assert_eq!(tombstone.version, Some(3));
		assert!(store.all_keys().is_empty());

		// A patch at the tombstone's version is still stale.
		assert!(store
			.apply_patch("a", FlagDescriptor::new(json!(false)).with_version(3))
			.is_none());
	}

	#[test]
	fn stale_delete_is_ignored() {
		let store = store_with(&[("a", FlagDescriptor::new(json!(true)).with_version(6))]);
		assert!(store.apply_delete("a", Some(6)).is_none());
		assert!(store.get("a").unwrap().is_live());
	}

	#[test]
	fn deleting_unknown_flag_records_tombstone_without_changes() {
		let store = FlagStore::new();
		let changes = store.apply_delete("ghost", Some(1)).unwrap();
		assert!(changes.is_empty());
		assert_eq!(store.len(), 1);
		assert!(store.values().is_empty());
	}

	#[test]
	fn clear_empties_the_table() {
		let store = store_with(&[("a", FlagDescriptor::new(json!(1)))]);
		store.clear();
		assert!(store.is_empty());
		assert!(store.snapshot().is_empty());
	}
}

#[cfg(test)]
mod proptests {
	use super::*;
	use proptest::prelude::*;
	use serde_json::json;

	proptest! {
		#[test]
		fn stored_version_never_decreases_under_versioned_updates(
			ops in proptest::collection::vec((any::<bool>(), 0u64..20), 1..40)
		) {
			let store = FlagStore::new();
			let mut highest: Option<u64> = None;
			for (is_patch, version) in ops {
				if is_patch {
					store.apply_patch("k", FlagDescriptor::new(json!(version)).with_version(version));
				} else {
					store.apply_delete("k", Some(version));
				}
				highest = Some(highest.map_or(version, |h| h.max(version)));
				prop_assert_eq!(store.get("k").and_then(|d| d.version), highest);
			}
		}
	}
}
