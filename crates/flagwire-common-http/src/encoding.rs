// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Encodes a string as unpadded URL-safe base64 for use in paths and queries.
pub fn base64url(input: &str) -> String {
	URL_SAFE_NO_PAD.encode(input.as_bytes())
}
