// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Flag and goal fetches against the evaluation service.

use flagwire_common_http::{base64url, user_agent};
use flagwire_core::format::table_from_payload;
use flagwire_core::goal::parse_goals;
use flagwire_core::platform::CancelHook;
use flagwire_core::{
	EvaluationContext, FlagTable, FlagsError, Goal, HttpMethod, HttpRequest, HttpResponse,
	PendingResponse, Platform, PlatformError, Result,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Lets only the most recently issued request of one kind win.
///
/// Issuing a request cancels the one before it. Every caller, including
/// those whose own request was superseded, receives the result of the last
/// request issued.
pub struct RequestCoalescer<T> {
	state: Mutex<CoalescerState>,
	latest: watch::Sender<Option<(u64, Result<T>)>>,
}

#[derive(Default)]
struct CoalescerState {
	generation: u64,
	cancel: Option<CancelHook>,
}

impl<T> Default for RequestCoalescer<T> {
	fn default() -> Self {
		Self {
			state: Mutex::new(CoalescerState::default()),
			latest: watch::channel(None).0,
		}
	}
}

impl<T> std::fmt::Debug for RequestCoalescer<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RequestCoalescer")
			.field("generation", &self.state.lock().generation)
			.finish()
	}
}

impl<T: Clone + Send + Sync> RequestCoalescer<T> {
	pub fn new() -> Self {
		Self::default()
	}

	/// Awaits `pending` and interprets it with `parse`, returning whichever
	/// result belongs to the latest request.
	pub async fn run(
		&self,
		pending: PendingResponse,
		parse: impl FnOnce(std::result::Result<HttpResponse, PlatformError>) -> Result<T>,
	) -> Result<T> {
		let generation = {
			let mut state = self.state.lock();
			state.generation += 1;
			if let Some(cancel) = state.cancel.take() {
				debug!(generation = state.generation, "Cancelling superseded request");
				cancel();
			}
			state.cancel = pending.cancel;
			state.generation
		};
		let mut latest = self.latest.subscribe();
		let mut guard = AbandonGuard {
			coalescer: self,
			generation,
			armed: true,
		};

		let outcome = parse(pending.response.await);

		{
			let mut state = self.state.lock();
			guard.armed = false;
			if state.generation == generation {
				state.cancel = None;
				self.latest.send_replace(Some((generation, outcome.clone())));
				return outcome;
			}
		}

		let published = latest
			.wait_for(|value| matches!(value, Some((g, _)) if *g > generation))
			.await;
		match published {
			Ok(value) => match &*value {
				Some((_, result)) => result.clone(),
				None => outcome,
			},
			Err(_) => outcome,
		}
	}
}

/// Publishes a cancellation for a request whose caller stopped waiting
/// while it was still the latest, so superseded callers are released.
struct AbandonGuard<'a, T> {
	coalescer: &'a RequestCoalescer<T>,
	generation: u64,
	armed: bool,
}

impl<T> Drop for AbandonGuard<'_, T> {
	fn drop(&mut self) {
		if !self.armed {
			return;
		}
		let mut state = self.coalescer.state.lock();
		if state.generation != self.generation {
			return;
		}
		if let Some(cancel) = state.cancel.take() {
			cancel();
		}
		debug!(generation = self.generation, "Latest request abandoned");
		self.coalescer.latest.send_replace(Some((
			self.generation,
			Err(FlagsError::network(PlatformError::Cancelled)),
		)));
	}
}

/// Builds and sends flag and goal requests.
#[derive(Debug)]
pub struct Requestor {
	platform: Platform,
	base_url: String,
	environment: String,
	use_report: bool,
	with_reasons: bool,
	flags: RequestCoalescer<FlagTable>,
	goals: RequestCoalescer<Vec<Goal>>,
}

impl Requestor {
	pub fn new(
		platform: Platform,
		base_url: impl Into<String>,
		environment: impl Into<String>,
		use_report: bool,
		with_reasons: bool,
	) -> Self {
		Self {
			platform,
			base_url: base_url.into(),
			environment: environment.into(),
			use_report,
			with_reasons,
			flags: RequestCoalescer::new(),
			goals: RequestCoalescer::new(),
		}
	}

	/// Fetches evaluated flags for `context`.
	pub async fn fetch_flag_settings(
		&self,
		context: &EvaluationContext,
		hash: Option<&str>,
	) -> Result<FlagTable> {
		let body = serde_json::to_string(context)
			.map_err(|e| FlagsError::InvalidContext(e.to_string()))?;
		let query = query_string(hash, self.with_reasons);

		let request = if self.use_report {
			HttpRequest::get(format!(
				"{}/sdk/evalx/{}/user{query}",
				self.base_url, self.environment
			))
			.with_method(HttpMethod::Report)
			.with_header("Content-Type", JSON_CONTENT_TYPE)
			.with_body(body)
		} else {
			HttpRequest::get(format!(
				"{}/sdk/evalx/{}/users/{}{query}",
				self.base_url,
				self.environment,
				base64url(&body)
			))
		};

		debug!(method = %request.method, url = %request.url, "Fetching flag settings");
		let pending = self.send(request)?;
		self.flags.run(pending, parse_flag_response).await
	}

	/// Fetches the goal definitions for the environment.
	pub async fn fetch_goals(&self) -> Result<Vec<Goal>> {
		let request = HttpRequest::get(format!("{}/sdk/goals/{}", self.base_url, self.environment));
		let pending = self.send(request)?;
		self.goals
			.run(pending, |response| {
				let response = checked_json_response(response)?;
				parse_goals(&response.body)
					.map_err(|e| FlagsError::UnexpectedResponse(format!("malformed goals: {e}")))
			})
			.await
	}

	fn send(&self, request: HttpRequest) -> Result<PendingResponse> {
		let http = self
			.platform
			.http()
			.ok_or_else(|| FlagsError::network(PlatformError::Unsupported("HTTP requests")))?;
		Ok(http.request(
			request
				.with_header("Accept", JSON_CONTENT_TYPE)
				.with_header("User-Agent", user_agent()),
		))
	}
}

fn query_string(hash: Option<&str>, with_reasons: bool) -> String {
	let mut params = Vec::new();
	if let Some(hash) = hash.filter(|h| !h.is_empty()) {
		params.push(format!("h={hash}"));
	}
	if with_reasons {
		params.push("withReasons=true".to_string());
	}
	if params.is_empty() {
		String::new()
	} else {
		format!("?{}", params.join("&"))
	}
}

fn checked_json_response(
	response: std::result::Result<HttpResponse, PlatformError>,
) -> Result<HttpResponse> {
	let response = response.map_err(FlagsError::network)?;
	if response.status != 200 {
		return Err(FlagsError::from_fetch_status(response.status, ""));
	}
	let content_type = response.header("Content-Type").unwrap_or_default();
	if !content_type.starts_with(JSON_CONTENT_TYPE) {
		return Err(FlagsError::FlagFetch {
			status: Some(response.status),
			message: format!("expected JSON response, got content type \"{content_type}\""),
		});
	}
	Ok(response)
}

fn parse_flag_response(
	response: std::result::Result<HttpResponse, PlatformError>,
) -> Result<FlagTable> {
	let response = checked_json_response(response)?;
	serde_json::from_str(&response.body)
		.and_then(table_from_payload)
		.map_err(|e| FlagsError::FlagFetch {
			status: Some(response.status),
			message: format!("malformed flag payload: {e}"),
		})
}
