// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Flag descriptors, evaluation reasons and evaluation results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Flag key to descriptor. Ordered so diffs and snapshots are deterministic.
pub type FlagTable = BTreeMap<String, FlagDescriptor>;

/// Flag key to bare value, the shape returned by `identify` and `all_flags`.
pub type FlagValues = BTreeMap<String, Value>;

/// The stored value and metadata for one flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagDescriptor {
	/// Evaluated value. `Null` on tombstones.
	#[serde(default)]
	pub value: Value,
	/// Monotonic version; absent on legacy payloads.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<u64>,
	/// Index of the variation that produced `value`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub variation: Option<u32>,
	/// Unreadable reasons decode as [`EvaluationReason::Unknown`].
	#[serde(
		default,
		deserialize_with = "lenient_reason",
		skip_serializing_if = "Option::is_none"
	)]
	pub reason: Option<EvaluationReason>,
	/// Version of the flag configuration, preferred over `version` for event attribution.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub flag_version: Option<u64>,
	#[serde(default, skip_serializing_if = "is_false")]
	pub track_events: bool,
	/// Include the evaluation reason in feature events for this flag.
	#[serde(default, skip_serializing_if = "is_false")]
	pub track_reason: bool,
	/// Epoch millis until which debug events are emitted.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub debug_events_until_date: Option<i64>,
	#[serde(default, skip_serializing_if = "is_false")]
	pub deleted: bool,
}

fn is_false(b: &bool) -> bool {
	!*b
}

fn lenient_reason<'de, D>(deserializer: D) -> Result<Option<EvaluationReason>, D::Error>
where
	D: serde::Deserializer<'de>,
{
	let raw = Option::<Value>::deserialize(deserializer)?;
	Ok(raw.map(|raw| serde_json::from_value(raw).unwrap_or(EvaluationReason::Unknown)))
}

impl FlagDescriptor {
	pub fn new(value: Value) -> Self {
		Self {
			value,
			..Default::default()
		}
	}

	/// Upconverts a bare legacy value.
	pub fn legacy(value: Value) -> Self {
		Self {
			value,
			version: Some(0),
			..Default::default()
		}
	}

	/// A deletion marker that keeps the version for later comparisons.
	pub fn tombstone(version: Option<u64>) -> Self {
		Self {
			version,
			deleted: true,
			..Default::default()
		}
	}

	pub fn with_version(mut self, version: u64) -> Self {
		self.version = Some(version);
		self
	}

	pub fn with_variation(mut self, variation: u32) -> Self {
		self.variation = Some(variation);
		self
	}

	pub fn with_reason(mut self, reason: EvaluationReason) -> Self {
		self.reason = Some(reason);
		self
	}

	pub fn with_track_events(mut self, track_events: bool) -> Self {
		self.track_events = track_events;
		self
	}

	pub fn with_debug_events_until(mut self, epoch_millis: i64) -> Self {
		self.debug_events_until_date = Some(epoch_millis);
		self
	}

	pub fn is_live(&self) -> bool {
		!self.deleted
	}

	/// The version to attribute analytics events to.
	pub fn event_version(&self) -> Option<u64> {
		self.flag_version.or(self.version)
	}

	pub fn detail(&self) -> EvaluationDetail {
		EvaluationDetail {
			value: self.value.clone(),
			variation_index: self.variation,
			reason: self.reason.clone(),
		}
	}

	/// Whether an update carrying `incoming` may replace `existing`.
	///
	/// Last writer wins by version, except that a versionless value on either
	/// side always wins.
	pub fn supersedes(incoming: Option<u64>, existing: Option<&FlagDescriptor>) -> bool {
		match (incoming, existing.and_then(|d| d.version)) {
			(Some(new), Some(old)) => new > old,
			_ => true,
		}
	}
}

/// Why a flag evaluated to its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationReason {
	Off,
	Fallthrough,
	TargetMatch,
	#[serde(rename_all = "camelCase")]
	RuleMatch {
		rule_index: u32,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		rule_id: Option<String>,
	},
	#[serde(rename_all = "camelCase")]
	PrerequisiteFailed { prerequisite_key: String },
	#[serde(rename_all = "camelCase")]
	Error { error_kind: ErrorKind },
	#[serde(other)]
	Unknown,
}

impl EvaluationReason {
	pub fn flag_not_found() -> Self {
		EvaluationReason::Error {
			error_kind: ErrorKind::FlagNotFound,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
	ClientNotReady,
	FlagNotFound,
	MalformedFlag,
	UserNotSpecified,
	WrongType,
	Exception,
	#[serde(other)]
	Unknown,
}

/// The result of evaluating one flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDetail {
	pub value: Value,
	pub variation_index: Option<u32>,
	pub reason: Option<EvaluationReason>,
}

impl EvaluationDetail {
	/// The result for a flag that is absent or deleted.
	pub fn not_found(default: Value) -> Self {
		Self {
			value: default,
			variation_index: None,
			reason: Some(EvaluationReason::flag_not_found()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn descriptor_roundtrips_through_wire_names() {
		let raw = json!({
			"value": true,
			"version": 7,
			"variation": 1,
			"reason": { "kind": "RULE_MATCH", "ruleIndex": 2, "ruleId": "r2" },
			"flagVersion": 3,
			"trackEvents": true,
			"debugEventsUntilDate": 1_700_000_000_000i64,
		});
		let descriptor: FlagDescriptor = serde_json::from_value(raw.clone()).unwrap();
		assert_eq!(descriptor.version, Some(7));
		assert_eq!(descriptor.variation, Some(1));
		assert_eq!(descriptor.event_version(), Some(3));
		assert!(descriptor.track_events);
		assert_eq!(
			descriptor.reason,
			Some(EvaluationReason::RuleMatch {
				rule_index: 2,
				rule_id: Some("r2".into())
			})
		);
		assert_eq!(serde_json::to_value(&descriptor).unwrap(), raw);
	}

	#[test]
	fn unknown_reason_kinds_are_tolerated() {
		let reason: EvaluationReason =
			serde_json::from_value(json!({ "kind": "SOMETHING_NEW" })).unwrap();
		assert_eq!(reason, EvaluationReason::Unknown);
	}

	#[test]
	fn unknown_error_kinds_are_tolerated() {
		let reason: EvaluationReason =
			serde_json::from_value(json!({ "kind": "ERROR", "errorKind": "SOME_NEW_KIND" })).unwrap();
		assert_eq!(
			reason,
			EvaluationReason::Error {
				error_kind: ErrorKind::Unknown
			}
		);
	}

	#[test]
	fn malformed_reason_does_not_reject_the_descriptor() {
		let descriptor: FlagDescriptor = serde_json::from_value(json!({
			"value": 1,
			"version": 2,
			"reason": { "kind": "RULE_MATCH", "ruleIndex": "not a number" },
		}))
		.unwrap();
		assert_eq!(descriptor.value, json!(1));
		assert_eq!(descriptor.reason, Some(EvaluationReason::Unknown));
	}

	#[test]
	fn flag_not_found_reason_shape() {
		assert_eq!(
			serde_json::to_value(EvaluationReason::flag_not_found()).unwrap(),
			json!({ "kind": "ERROR", "errorKind": "FLAG_NOT_FOUND" })
		);
	}

	#[test]
	fn tombstone_keeps_version_and_drops_value() {
		let tombstone = FlagDescriptor::tombstone(Some(4));
		assert!(!tombstone.is_live());
		assert_eq!(tombstone.version, Some(4));
		assert_eq!(tombstone.value, Value::Null);
	}

	#[test]
	fn supersedes_examples() {
		let v2 = FlagDescriptor::new(json!(1)).with_version(2);
		assert!(!FlagDescriptor::supersedes(Some(1), Some(&v2)));
		assert!(!FlagDescriptor::supersedes(Some(2), Some(&v2)));
		assert!(FlagDescriptor::supersedes(Some(3), Some(&v2)));
		assert!(FlagDescriptor::supersedes(None, Some(&v2)));
		assert!(FlagDescriptor::supersedes(Some(1), None));
		let versionless = FlagDescriptor::new(json!(1));
		assert!(FlagDescriptor::supersedes(Some(0), Some(&versionless)));
	}
}
