// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Change records produced by flag table mutations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flag::{EvaluationDetail, FlagDescriptor, FlagTable};

/// What happened to one flag.
///
/// `previous` is absent for a newly created flag and `current` is absent for
/// a deleted one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagChange {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub previous: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub current: Option<EvaluationDetail>,
}

impl FlagChange {
	pub fn created(current: &FlagDescriptor) -> Self {
		Self {
			previous: None,
			current: Some(current.detail()),
		}
	}

	pub fn updated(previous: &FlagDescriptor, current: &FlagDescriptor) -> Self {
		Self {
			previous: Some(previous.value.clone()),
			current: Some(current.detail()),
		}
	}

	pub fn deleted(previous: &FlagDescriptor) -> Self {
		Self {
			previous: Some(previous.value.clone()),
			current: None,
		}
	}

	pub fn is_deletion(&self) -> bool {
		self.current.is_none()
	}

	/// The value listeners observe after the change; `Null` for a deletion.
	pub fn current_value(&self) -> Value {
		self.current
			.as_ref()
			.map(|c| c.value.clone())
			.unwrap_or(Value::Null)
	}
}

/// Per-key changes from a single mutation.
pub type ChangeSet = BTreeMap<String, FlagChange>;

/// Diffs two tables by value.
///
/// Tombstones count as absent on both sides, so a tombstone in `new` reads as
/// a deletion and a live flag replacing an old tombstone reads as a creation.
pub fn diff_tables(old: &FlagTable, new: &FlagTable) -> ChangeSet {
	let mut changes = ChangeSet::new();

	for (key, previous) in old.iter().filter(|(_, d)| d.is_live()) {
		match new.get(key).filter(|d| d.is_live()) {
			None => {
				changes.insert(key.clone(), FlagChange::deleted(previous));
			}
			Some(current) if current.value != previous.value => {
				changes.insert(key.clone(), FlagChange::updated(previous, current));
			}
			Some(_) => {}
		}
	}

	for (key, current) in new.iter().filter(|(_, d)| d.is_live()) {
		if !old.get(key).is_some_and(FlagDescriptor::is_live) {
			changes.insert(key.clone(), FlagChange::created(current));
		}
	}

	changes
}
