// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-flush aggregation of feature evaluations.

use std::collections::BTreeMap;

use flagwire_core::event::{FlagSummary, SummaryCounter, SummaryOutput};
use flagwire_core::FeatureEvent;
use serde_json::Value;

type CounterKey = (String, Option<u32>, Option<u64>);

#[derive(Debug, Clone)]
struct Counter {
	value: Value,
	count: u64,
}

/// Counts evaluations by flag key, variation and version.
#[derive(Debug, Default)]
pub struct EventSummarizer {
	counters: BTreeMap<CounterKey, Counter>,
	defaults: BTreeMap<String, Value>,
	start_date: i64,
	end_date: i64,
}

impl EventSummarizer {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn summarize_event(&mut self, event: &FeatureEvent) {
		let key = (event.key.clone(), event.variation, event.version);
		self.counters
			.entry(key)
			.and_modify(|c| c.count += 1)
			.or_insert_with(|| Counter {
				value: event.value.clone(),
				count: 1,
			});
		self.defaults
			.entry(event.key.clone())
			.or_insert_with(|| event.default.clone());

		if self.start_date == 0 || event.creation_date < self.start_date {
			self.start_date = event.creation_date;
		}
		if event.creation_date > self.end_date {
			self.end_date = event.creation_date;
		}
	}

	/// The summary of everything counted since the last clear, or `None` if
	/// nothing was counted.
	pub fn summary(&self) -> Option<SummaryOutput> {
		if self.counters.is_empty() {
			return None;
		}

		let mut features: BTreeMap<String, FlagSummary> = BTreeMap::new();
		for ((key, variation, version), counter) in &self.counters {
			let flag = features.entry(key.clone()).or_insert_with(|| FlagSummary {
				default: self.defaults.get(key).cloned().unwrap_or(Value::Null),
				counters: Vec::new(),
			});
			flag.counters.push(SummaryCounter {
				value: counter.value.clone(),
				variation: *variation,
				version: *version,
				count: counter.count,
				unknown: version.is_none().then_some(true),
			});
		}

		Some(SummaryOutput {
			start_date: self.start_date,
			end_date: self.end_date,
			features,
		})
	}

	pub fn clear(&mut self) {
		self.counters.clear();
		self.defaults.clear();
		self.start_date = 0;
		self.end_date = 0;
	}

	pub fn is_empty(&self) -> bool {
		self.counters.is_empty()
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use flagwire_core::EvaluationContext;
	use serde_json::json;

	pub(crate) fn feature(key: &str, variation: Option<u32>, version: Option<u64>, at: i64) -> FeatureEvent {
		FeatureEvent {
			creation_date: at,
			key: key.to_string(),
			context: EvaluationContext::new("u1"),
			value: json!(variation.unwrap_or(99)),
			variation,
			default: json!("default"),
			version,
			reason: None,
			track_events: false,
			debug_events_until_date: None,
		}
	}

	#[test]
	fn empty_summarizer_has_no_summary() {
		assert!(EventSummarizer::new().summary().is_none());
	}

	#[test]
	fn counts_by_variation_and_version() {
		let mut summarizer = EventSummarizer::new();
		summarizer.summarize_event(&feature("a", Some(0), Some(1), 2000));
		summarizer.summarize_event(&feature("a", Some(0), Some(1), 1000));
		summarizer.summarize_event(&feature("a", Some(1), Some(1), 3000));
		summarizer.summarize_event(&feature("b", None, None, 1500));

		let summary = summarizer.summary().unwrap();
		assert_eq!(summary.start_date, 1000);
		assert_eq!(summary.end_date, 3000);

		let a = &summary.features["a"];
		assert_eq!(a.default, json!("default"));
		assert_eq!(a.counters.len(), 2);
		assert_eq!(a.counters[0].count, 2);
		assert_eq!(a.counters[0].variation, Some(0));
		assert_eq!(a.counters[1].count, 1);
		assert_eq!(a.counters[0].unknown, None);

		let b = &summary.features["b"];
		assert_eq!(b.counters[0].unknown, Some(true));
		assert_eq!(b.counters[0].version, None);
	}

	#[test]
	fn first_default_wins() {
		let mut summarizer = EventSummarizer::new();
		let mut first = feature("a", Some(0), Some(1), 1);
		first.default = json!(1);
		let mut second = feature("a", Some(0), Some(1), 2);
		second.default = json!(2);
		summarizer.summarize_event(&first);
		summarizer.summarize_event(&second);
		assert_eq!(summarizer.summary().unwrap().features["a"].default, json!(1));
	}

	#[test]
	fn clear_resets_everything() {
		let mut summarizer = EventSummarizer::new();
		summarizer.summarize_event(&feature("a", Some(0), Some(1), 5));
		summarizer.clear();
		assert!(summarizer.is_empty());
		assert!(summarizer.summary().is_none());

		summarizer.summarize_event(&feature("a", Some(0), Some(1), 9));
		assert_eq!(summarizer.summary().unwrap().start_date, 9);
	}
}

#[cfg(test)]
mod proptests {
	use super::tests::feature;
	use super::*;
	use proptest::prelude::*;

	proptest! {
		#[test]
		fn total_count_equals_events_summarized(
			events in prop::collection::vec((0u32..3, prop::option::of(1u64..3), 1i64..10_000), 1..50)
		) {
			let mut summarizer = EventSummarizer::new();
			for (variation, version, at) in &events {
				summarizer.summarize_event(&feature("flag", Some(*variation), *version, *at));
			}
			let summary = summarizer.summary().unwrap();
			let total: u64 = summary.features["flag"].counters.iter().map(|c| c.count).sum();
			prop_assert_eq!(total, events.len() as u64);
			prop_assert_eq!(summary.start_date, events.iter().map(|e| e.2).min().unwrap());
			prop_assert_eq!(summary.end_date, events.iter().map(|e| e.2).max().unwrap());
		}
	}
}
