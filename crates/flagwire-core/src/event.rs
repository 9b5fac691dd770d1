// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Analytics events.
//!
//! [`AnalyticsEvent`] is what the client records. [`OutputEvent`] is what goes
//! on the wire after sampling, context filtering and summarization.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::EvaluationContext;
use crate::flag::EvaluationReason;

/// A recorded flag evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureEvent {
	pub creation_date: i64,
	pub key: String,
	pub context: EvaluationContext,
	pub value: Value,
	pub variation: Option<u32>,
	pub default: Value,
	pub version: Option<u64>,
	pub reason: Option<EvaluationReason>,
	pub track_events: bool,
	pub debug_events_until_date: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentifyEvent {
	pub creation_date: i64,
	pub context: EvaluationContext,
}

/// A user-tracked event.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomEvent {
	pub creation_date: i64,
	pub key: String,
	pub context: EvaluationContext,
	pub data: Option<Value>,
	pub metric_value: Option<f64>,
	/// Page or screen the event was tracked on, when the host knows it.
	pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalyticsEvent {
	Identify(IdentifyEvent),
	Feature(FeatureEvent),
	Custom(CustomEvent),
}

impl AnalyticsEvent {
	pub fn kind(&self) -> &'static str {
		match self {
			AnalyticsEvent::Identify(_) => "identify",
			AnalyticsEvent::Feature(_) => "feature",
			AnalyticsEvent::Custom(_) => "custom",
		}
	}

	pub fn creation_date(&self) -> i64 {
		match self {
			AnalyticsEvent::Identify(e) => e.creation_date,
			AnalyticsEvent::Feature(e) => e.creation_date,
			AnalyticsEvent::Custom(e) => e.creation_date,
		}
	}

	pub fn context(&self) -> &EvaluationContext {
		match self {
			AnalyticsEvent::Identify(e) => &e.context,
			AnalyticsEvent::Feature(e) => &e.context,
			AnalyticsEvent::Custom(e) => &e.context,
		}
	}
}

/// An event as serialized in a delivery batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutputEvent {
	Identify(IdentifyOutput),
	Feature(FeatureOutput),
	Debug(FeatureOutput),
	Custom(CustomOutput),
	Summary(SummaryOutput),
}

impl OutputEvent {
	pub fn kind(&self) -> &'static str {
		match self {
			OutputEvent::Identify(_) => "identify",
			OutputEvent::Feature(_) => "feature",
			OutputEvent::Debug(_) => "debug",
			OutputEvent::Custom(_) => "custom",
			OutputEvent::Summary(_) => "summary",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyOutput {
	pub creation_date: i64,
	pub key: String,
	/// Privacy-filtered context.
	pub user: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureOutput {
	pub creation_date: i64,
	pub key: String,
	/// Inline privacy-filtered context; exclusive with `user_key`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_key: Option<String>,
	pub value: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub variation: Option<u32>,
	#[serde(default)]
	pub default: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<EvaluationReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomOutput {
	pub creation_date: i64,
	pub key: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_key: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub metric_value: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub url: Option<String>,
}

/// Aggregated evaluation counters for one flush window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryOutput {
	pub start_date: i64,
	pub end_date: i64,
	pub features: BTreeMap<String, FlagSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagSummary {
	#[serde(default)]
	pub default: Value,
	pub counters: Vec<SummaryCounter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryCounter {
	pub value: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub variation: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<u64>,
	pub count: u64,
	/// Set when the flag was not known to the client.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub unknown: Option<bool>,
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn feature_output_serializes_with_kind_tag() {
		let event = OutputEvent::Feature(FeatureOutput {
			creation_date: 1000,
			key: "flag".into(),
			user: None,
			user_key: Some("u1".into()),
			value: json!(true),
			variation: Some(0),
			default: json!(false),
			version: Some(3),
			reason: None,
		});
		assert_eq!(
			serde_json::to_value(&event).unwrap(),
			json!({
				"kind": "feature",
				"creationDate": 1000,
				"key": "flag",
				"userKey": "u1",
				"value": true,
				"variation": 0,
				"default": false,
				"version": 3,
			})
		);
	}

	#[test]
	fn debug_events_reuse_the_feature_shape() {
		let raw = json!({
			"kind": "debug",
			"creationDate": 5,
			"key": "flag",
			"user": { "key": "u1" },
			"value": 1,
			"default": 0,
		});
		let event: OutputEvent = serde_json::from_value(raw).unwrap();
		assert_eq!(event.kind(), "debug");
	}

	#[test]
	fn summary_counter_marks_unknown_flags() {
		let counter = SummaryCounter {
			value: json!("d"),
			variation: None,
			version: None,
			count: 2,
			unknown: Some(true),
		};
		assert_eq!(
			serde_json::to_value(&counter).unwrap(),
			json!({ "value": "d", "count": 2, "unknown": true })
		);
	}
}
