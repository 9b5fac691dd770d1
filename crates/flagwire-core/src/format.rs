// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Conversions between the wire, bootstrap and cache shapes of a flag table.
//!
//! Two shapes exist:
//!
//! - the versioned shape, `{ "<key>": { "value": .., "version": .., .. } }`
//! - the legacy shape, `{ "<key>": <raw value> }`
//!
//! Legacy values are upconverted to `{ value, version: 0 }` on ingestion so the
//! table never mixes the two.

use serde_json::{Map, Value};
use tracing::warn;

use crate::flag::{FlagDescriptor, FlagTable};

/// Bootstrap key carrying per-flag metadata.
pub const BOOTSTRAP_STATE_KEY: &str = "$flagsState";

/// Bootstrap key set to `false` when the server could not evaluate flags.
pub const BOOTSTRAP_VALID_KEY: &str = "$valid";

/// Cache blob key tagging the versioned shape.
pub const CACHE_SCHEMA_KEY: &str = "$schema";

pub const CACHE_SCHEMA_VERSION: u64 = 1;

/// Upconverts a legacy value map.
pub fn legacy_to_table(values: Map<String, Value>) -> FlagTable {
	values
		.into_iter()
		.map(|(key, value)| (key, FlagDescriptor::legacy(value)))
		.collect()
}

/// Parses a flag payload from the evaluation endpoint or a stream `put`.
///
/// A payload is treated as versioned when every entry is an object carrying a
/// `value` or `deleted` member; anything else is the legacy shape.
pub fn table_from_payload(payload: Value) -> Result<FlagTable, serde_json::Error> {
	let map = match payload {
		Value::Object(map) => map,
		other => {
			return Err(serde::de::Error::custom(format!(
				"flag payload must be an object, got {other}"
			)))
		}
	};

	if map.values().all(is_versioned_entry) {
		map.into_iter()
			.map(|(key, raw)| Ok((key, serde_json::from_value(raw)?)))
			.collect()
	} else {
		Ok(legacy_to_table(map))
	}
}

fn is_versioned_entry(raw: &Value) -> bool {
	raw.as_object()
		.is_some_and(|o| o.contains_key("value") || o.contains_key("deleted"))
}

/// Ingests a bootstrap map handed to the client at startup.
///
/// Without `$flagsState` every value is taken as legacy and a warning is logged.
/// Metadata entries are merged over `{ value }`; flags with no metadata get
/// version 0.
pub fn read_bootstrap(mut data: Map<String, Value>) -> FlagTable {
	let metadata = data.remove(BOOTSTRAP_STATE_KEY);
	let valid = data.remove(BOOTSTRAP_VALID_KEY);

	if metadata.is_none() && !data.is_empty() {
		warn!("bootstrap data is in the old format; evaluation reasons and event tracking are unavailable");
	}
	if valid == Some(Value::Bool(false)) {
		warn!("bootstrap data was marked invalid by the server; flag values may be defaults");
	}

	let metadata = match metadata {
		Some(Value::Object(map)) => map,
		_ => Map::new(),
	};

	data.into_iter()
		.map(|(key, value)| {
			let descriptor = match metadata.get(&key) {
				Some(Value::Object(meta)) => {
					let mut merged = meta.clone();
					merged.insert("value".to_string(), value.clone());
					serde_json::from_value(Value::Object(merged)).unwrap_or_else(|e| {
						warn!(flag_key = %key, error = %e, "ignoring malformed bootstrap metadata");
						FlagDescriptor::legacy(value)
					})
				}
				_ => FlagDescriptor::legacy(value),
			};
			(key, descriptor)
		})
		.collect()
}

/// Serializes a table for the persistent cache, tagging the schema.
pub fn encode_cache_blob(table: &FlagTable) -> Result<String, serde_json::Error> {
	let mut map = match serde_json::to_value(table)? {
		Value::Object(map) => map,
		_ => Map::new(),
	};
	map.insert(CACHE_SCHEMA_KEY.to_string(), Value::from(CACHE_SCHEMA_VERSION));
	serde_json::to_string(&map)
}

/// Parses a cache blob written by [`encode_cache_blob`] or by an older client.
pub fn decode_cache_blob(blob: &str) -> Result<FlagTable, serde_json::Error> {
	let mut map: Map<String, Value> = serde_json::from_str(blob)?;
	let schema = map
		.remove(CACHE_SCHEMA_KEY)
		.and_then(|v| v.as_u64())
		.unwrap_or(0);

	if schema >= CACHE_SCHEMA_VERSION {
		map.into_iter()
			.map(|(key, raw)| Ok((key, serde_json::from_value(raw)?)))
			.collect()
	} else {
		Ok(legacy_to_table(map))
	}
}
