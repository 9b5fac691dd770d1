// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! A/B test goal definitions served by the goals endpoint.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
	pub key: String,
	/// `pageview` or `click`.
	pub kind: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub selector: Option<String>,
	#[serde(default)]
	pub urls: Vec<GoalUrl>,
}

/// A URL matcher attached to a goal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GoalUrl {
	Exact { url: String },
	Canonical { url: String },
	Substring { substring: String },
	Regex { pattern: String },
}

/// Parses a goals payload.
pub fn parse_goals(body: &str) -> Result<Vec<Goal>, serde_json::Error> {
	serde_json::from_str(body)
}
