// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Capabilities the host supplies to the client.
//!
//! Every network, storage and clock interaction goes through these traits so
//! the same engine runs on any host. [`Platform`] bundles one implementation
//! of each; only the probes are mandatory.

use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::PlatformError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
	Get,
	Post,
	/// Body-carrying read used when the context travels in the request body.
	Report,
}

impl HttpMethod {
	pub fn as_str(&self) -> &'static str {
		match self {
			HttpMethod::Get => "GET",
			HttpMethod::Post => "POST",
			HttpMethod::Report => "REPORT",
		}
	}
}

impl fmt::Display for HttpMethod {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
	pub method: HttpMethod,
	pub url: String,
	pub headers: Vec<(String, String)>,
	pub body: Option<String>,
}

impl HttpRequest {
	pub fn get(url: impl Into<String>) -> Self {
		Self {
			method: HttpMethod::Get,
			url: url.into(),
			headers: Vec::new(),
			body: None,
		}
	}

	pub fn with_method(mut self, method: HttpMethod) -> Self {
		self.method = method;
		self
	}

	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.push((name.into(), value.into()));
		self
	}

	pub fn with_body(mut self, body: impl Into<String>) -> Self {
		self.body = Some(body.into());
		self
	}

	pub fn header(&self, name: &str) -> Option<&str> {
		find_header(&self.headers, name)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
	pub status: u16,
	pub headers: Vec<(String, String)>,
	pub body: String,
}

impl HttpResponse {
	pub fn new(status: u16) -> Self {
		Self {
			status,
			headers: Vec::new(),
			body: String::new(),
		}
	}

	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.push((name.into(), value.into()));
		self
	}

	pub fn with_body(mut self, body: impl Into<String>) -> Self {
		self.body = body.into();
		self
	}

	/// Case-insensitive header lookup.
	pub fn header(&self, name: &str) -> Option<&str> {
		find_header(&self.headers, name)
	}

	pub fn is_success(&self) -> bool {
		(200..300).contains(&self.status)
	}
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
	headers
		.iter()
		.find(|(k, _)| k.eq_ignore_ascii_case(name))
		.map(|(_, v)| v.as_str())
}

/// Aborts an in-flight request. Called at most once.
pub type CancelHook = Box<dyn FnOnce() + Send>;

/// A request that has been issued but not yet answered.
pub struct PendingResponse {
	pub response: BoxFuture<'static, Result<HttpResponse, PlatformError>>,
	pub cancel: Option<CancelHook>,
}

impl fmt::Debug for PendingResponse {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PendingResponse")
			.field("cancellable", &self.cancel.is_some())
			.finish()
	}
}

pub trait HttpTransport: Send + Sync {
	/// Issues a request. The returned future resolves once the response body
	/// has been read.
	fn request(&self, request: HttpRequest) -> PendingResponse;

	/// Whether the host may POST to a different origin.
	///
	/// When this is false events are delivered through [`ImageLoader`].
	fn supports_cross_origin_post(&self) -> bool {
		true
	}
}

/// Fire-and-forget GET whose only observable outcome is load or error.
pub trait ImageLoader: Send + Sync {
	fn load(&self, url: &str) -> BoxFuture<'static, bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
	pub url: String,
	pub method: HttpMethod,
	pub body: Option<String>,
}

/// One named message from the push subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
	pub name: String,
	pub data: String,
}

pub type EventStream = BoxStream<'static, Result<StreamEvent, PlatformError>>;

#[async_trait]
pub trait StreamTransport: Send + Sync {
	/// Opens a subscription. The stream ends when the connection drops.
	async fn open(&self, request: StreamRequest) -> Result<EventStream, PlatformError>;

	/// Whether a subscription may carry a request body.
	fn supports_report(&self) -> bool {
		false
	}
}

/// Async string store used for flag tables and the anonymous context key.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
	async fn get(&self, key: &str) -> Result<Option<String>, PlatformError>;
	async fn set(&self, key: &str, value: &str) -> Result<(), PlatformError>;
	async fn clear(&self, key: &str) -> Result<(), PlatformError>;
}

/// Synchronous host probes.
pub trait Probes: Send + Sync {
	/// Wall clock in epoch milliseconds.
	fn now_millis(&self) -> i64;

	fn current_url(&self) -> Option<String> {
		None
	}

	fn do_not_track(&self) -> bool {
		false
	}
}

/// Probes backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbes;

impl Probes for SystemProbes {
	fn now_millis(&self) -> i64 {
		chrono::Utc::now().timestamp_millis()
	}
}

/// The capability bundle handed to the client at construction.
#[derive(Clone)]
pub struct Platform {
	http: Option<Arc<dyn HttpTransport>>,
	image: Option<Arc<dyn ImageLoader>>,
	stream: Option<Arc<dyn StreamTransport>>,
	store: Option<Arc<dyn KeyValueStore>>,
	probes: Arc<dyn Probes>,
	cross_origin_post: Arc<OnceLock<bool>>,
}

impl Default for Platform {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for Platform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Platform")
			.field("http", &self.http.is_some())
			.field("image", &self.image.is_some())
			.field("stream", &self.stream.is_some())
			.field("store", &self.store.is_some())
			.finish()
	}
}

impl Platform {
	/// A platform with only the system clock.
	pub fn new() -> Self {
		Self {
			http: None,
			image: None,
			stream: None,
			store: None,
			probes: Arc::new(SystemProbes),
			cross_origin_post: Arc::new(OnceLock::new()),
		}
	}

	pub fn with_http(mut self, http: Arc<dyn HttpTransport>) -> Self {
		self.http = Some(http);
		self.cross_origin_post = Arc::new(OnceLock::new());
		self
	}

	pub fn with_image_loader(mut self, image: Arc<dyn ImageLoader>) -> Self {
		self.image = Some(image);
		self
	}

	pub fn with_stream(mut self, stream: Arc<dyn StreamTransport>) -> Self {
		self.stream = Some(stream);
		self
	}

	pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
		self.store = Some(store);
		self
	}

	pub fn with_probes(mut self, probes: Arc<dyn Probes>) -> Self {
		self.probes = probes;
		self
	}

	pub fn http(&self) -> Option<&Arc<dyn HttpTransport>> {
		self.http.as_ref()
	}

	pub fn image_loader(&self) -> Option<&Arc<dyn ImageLoader>> {
		self.image.as_ref()
	}

	pub fn stream(&self) -> Option<&Arc<dyn StreamTransport>> {
		self.stream.as_ref()
	}

	pub fn store(&self) -> Option<&Arc<dyn KeyValueStore>> {
		self.store.as_ref()
	}

	pub fn probes(&self) -> &Arc<dyn Probes> {
		&self.probes
	}

	pub fn now_millis(&self) -> i64 {
		self.probes.now_millis()
	}

	/// Whether events can be POSTed, probed once per platform instance.
	pub fn has_cross_origin_post(&self) -> bool {
		*self.cross_origin_post.get_or_init(|| {
			self.http
				.as_ref()
				.is_some_and(|http| http.supports_cross_origin_post())
		})
	}
}
