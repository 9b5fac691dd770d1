// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Private attribute redaction for contexts embedded in events.

use std::collections::BTreeSet;

use flagwire_core::context::BUILT_IN_ATTRIBUTES;
use flagwire_core::EvaluationContext;
use serde_json::{Map, Value};

/// Attributes that can never be redacted as a whole.
const NEVER_PRIVATE: &[&str] = &["key", "custom", "anonymous"];

/// Strips private attributes from contexts and records what was removed.
#[derive(Debug, Clone, Default)]
pub struct ContextFilter {
	all_attributes_private: bool,
	private_attribute_names: Vec<String>,
}

impl ContextFilter {
	pub fn new(all_attributes_private: bool, private_attribute_names: Vec<String>) -> Self {
		Self {
			all_attributes_private,
			private_attribute_names,
		}
	}

	/// Produces the wire form of `context`.
	///
	/// Only built-in top-level attributes survive. Redacted names from both the
	/// top level and `custom` are listed, sorted, under `privateAttrs`.
	pub fn filter(&self, context: &EvaluationContext) -> Value {
		let raw = match serde_json::to_value(context) {
			Ok(Value::Object(map)) => map,
			_ => Map::new(),
		};
		let per_context: &[String] = context.private_attribute_names.as_deref().unwrap_or(&[]);
		let is_private = |name: &str| {
			!NEVER_PRIVATE.contains(&name)
				&& (self.all_attributes_private
					|| per_context.iter().any(|n| n == name)
					|| self.private_attribute_names.iter().any(|n| n == name))
		};

		let mut removed = BTreeSet::new();
		let mut filtered = Map::new();

		for (name, value) in raw {
			if !BUILT_IN_ATTRIBUTES.contains(&name.as_str()) {
				continue;
			}
			if name == "custom" {
				let custom = match value {
					Value::Object(custom) => custom,
					_ => continue,
				};
				let mut kept = Map::new();
				for (custom_name, custom_value) in custom {
					if is_private(custom_name.as_str()) {
						removed.insert(custom_name);
					} else {
						kept.insert(custom_name, custom_value);
					}
				}
				filtered.insert(name, Value::Object(kept));
			} else if is_private(name.as_str()) {
				removed.insert(name);
			} else {
				filtered.insert(name, value);
			}
		}

		if !removed.is_empty() {
			filtered.insert(
				"privateAttrs".to_string(),
				Value::Array(removed.into_iter().map(Value::String).collect()),
			);
		}

		Value::Object(filtered)
	}
}
