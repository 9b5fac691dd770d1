// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Messages delivered by the live update stream.
//!
//! # Events
//!
//! - `ping` - cached flags are stale, fetch the full set again
//! - `put` - full replacement table
//! - `patch` - one flag's new descriptor
//! - `delete` - one flag's key and version

use serde::{Deserialize, Serialize};

use crate::flag::{FlagDescriptor, FlagTable};
use crate::format::table_from_payload;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
	Ping,
	Put(FlagTable),
	Patch(PatchData),
	Delete(DeleteData),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchData {
	pub key: String,
	#[serde(flatten)]
	pub descriptor: FlagDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteData {
	pub key: String,
	#[serde(default)]
	pub version: Option<u64>,
}

impl StreamMessage {
	/// Parses a named message.
	///
	/// Returns `Ok(None)` for message names the client does not handle.
	pub fn parse(name: &str, data: &str) -> Result<Option<Self>, serde_json::Error> {
		let message = match name {
			"ping" => StreamMessage::Ping,
			"put" => StreamMessage::Put(table_from_payload(serde_json::from_str(data)?)?),
			"patch" => StreamMessage::Patch(serde_json::from_str(data)?),
			"delete" => StreamMessage::Delete(serde_json::from_str(data)?),
			_ => return Ok(None),
		};
		Ok(Some(message))
	}

	pub fn name(&self) -> &'static str {
		match self {
			StreamMessage::Ping => "ping",
			StreamMessage::Put(_) => "put",
			StreamMessage::Patch(_) => "patch",
			StreamMessage::Delete(_) => "delete",
		}
	}
}
