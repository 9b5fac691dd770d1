// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The evaluation context (historically "user") flags are evaluated for.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Top-level attributes that may appear on the wire.
pub const BUILT_IN_ATTRIBUTES: &[&str] = &[
	"key",
	"secondary",
	"ip",
	"country",
	"email",
	"firstName",
	"lastName",
	"avatar",
	"name",
	"anonymous",
	"custom",
];

/// Context passed to the service for flag evaluation.
///
/// Deserializing accepts a numeric or boolean `key` and stores it as a string,
/// so every context that enters the client carries a string key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
	#[serde(
		default,
		deserialize_with = "deserialize_key",
		skip_serializing_if = "Option::is_none"
	)]
	pub key: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub secondary: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ip: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub country: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub email: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub first_name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub avatar: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub anonymous: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub custom: Option<Map<String, Value>>,
	/// Attribute names to redact from analytics events for this context only.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub private_attribute_names: Option<Vec<String>>,
}

impl EvaluationContext {
	pub fn new(key: impl Into<String>) -> Self {
		Self {
			key: Some(key.into()),
			..Default::default()
		}
	}

	/// An anonymous context; the identity manager assigns its key.
	pub fn anonymous() -> Self {
		Self {
			anonymous: Some(true),
			..Default::default()
		}
	}

	/// Parses a raw JSON context, coercing a scalar key to a string.
	pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
		serde_json::from_value(value)
	}

	pub fn with_name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	pub fn with_email(mut self, email: impl Into<String>) -> Self {
		self.email = Some(email.into());
		self
	}

	pub fn with_country(mut self, country: impl Into<String>) -> Self {
		self.country = Some(country.into());
		self
	}

	pub fn with_custom(mut self, key: impl Into<String>, value: Value) -> Self {
		self.custom
			.get_or_insert_with(Map::new)
			.insert(key.into(), value);
		self
	}

	pub fn with_private_attribute(mut self, name: impl Into<String>) -> Self {
		self.private_attribute_names
			.get_or_insert_with(Vec::new)
			.push(name.into());
		self
	}

	pub fn is_anonymous(&self) -> bool {
		self.anonymous.unwrap_or(false)
	}

	/// The key, or an empty string for a context that has not been sanitized yet.
	pub fn key_or_empty(&self) -> &str {
		self.key.as_deref().unwrap_or_default()
	}

	/// Computes a deterministic fingerprint of the whole context.
	///
	/// Used to namespace persisted flag tables per context. The JSON encoding
	/// is canonical because `serde_json::Map` keeps keys sorted.
	pub fn fingerprint(&self) -> String {
		use sha2::{Digest, Sha256};

		let canonical = serde_json::to_value(self)
			.map(|v| v.to_string())
			.unwrap_or_default();
		let mut hasher = Sha256::new();
		hasher.update(canonical.as_bytes());
		hex::encode(hasher.finalize())
	}
}

fn deserialize_key<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
	D: Deserializer<'de>,
{
	match Option::<Value>::deserialize(deserializer)? {
		None | Some(Value::Null) => Ok(None),
		Some(Value::String(s)) => Ok(Some(s)),
		Some(Value::Number(n)) => Ok(Some(n.to_string())),
		Some(Value::Bool(b)) => Ok(Some(b.to_string())),
		Some(other) => Err(de::Error::custom(format!(
			"context key must be a string, got {other}"
		))),
	}
}
