// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

/// Whether a request that failed with `status` may succeed if repeated.
///
/// Within the 4xx range only 400, 408 and 429 are recoverable. Every other
/// status is.
pub fn is_http_error_recoverable(status: u16) -> bool {
	if (400..500).contains(&status) {
		return matches!(status, 400 | 408 | 429);
	}
	true
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn client_errors_are_mostly_fatal() {
		for status in [401, 403, 404, 405, 413] {
			assert!(!is_http_error_recoverable(status), "{status}");
		}
	}

	#[test]
	fn transient_statuses_are_recoverable() {
		for status in [400, 408, 429, 500, 502, 503, 504] {
			assert!(is_http_error_recoverable(status), "{status}");
		}
	}
}

#[cfg(test)]
mod proptests {
	use super::*;
	use proptest::prelude::*;

	proptest! {
		#[test]
		fn server_errors_are_always_recoverable(status in 500u16..600) {
			prop_assert!(is_http_error_recoverable(status));
		}

		#[test]
		fn recoverable_client_errors_are_the_allow_list(status in 400u16..500) {
			prop_assert_eq!(
				is_http_error_recoverable(status),
				[400, 408, 429].contains(&status)
			);
		}
	}
}
