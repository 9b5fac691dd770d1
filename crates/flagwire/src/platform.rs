// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Default capabilities built on `reqwest` and `eventsource-stream`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use flagwire_core::platform::{EventStream, StreamEvent, StreamRequest};
use flagwire_core::{
	FlagsError, HttpMethod, HttpRequest, HttpResponse, HttpTransport, ImageLoader, KeyValueStore,
	PendingResponse, Platform, PlatformError, StreamTransport,
};
use futures::future::{abortable, BoxFuture};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use reqwest::{Client, Method};
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn to_method(method: HttpMethod) -> Result<Method, PlatformError> {
	match method {
		HttpMethod::Get => Ok(Method::GET),
		HttpMethod::Post => Ok(Method::POST),
		HttpMethod::Report => {
			Method::from_bytes(b"REPORT").map_err(|_| PlatformError::Unsupported("REPORT method"))
		}
	}
}

fn network(e: reqwest::Error) -> PlatformError {
	PlatformError::Network(e.to_string())
}

fn build_client(builder: reqwest::ClientBuilder) -> Result<Client, FlagsError> {
	builder
		.build()
		.map_err(|e| FlagsError::InvalidArgument(format!("failed to build HTTP client: {e}")))
}

/// Request/response transport over a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestHttp {
	client: Client,
}

impl ReqwestHttp {
	pub fn new() -> Result<Self, FlagsError> {
		let client = build_client(
			flagwire_common_http::builder()
				.timeout(REQUEST_TIMEOUT)
				.connect_timeout(CONNECT_TIMEOUT),
		)?;
		Ok(Self { client })
	}

	pub fn with_client(client: Client) -> Self {
		Self { client }
	}
}

impl HttpTransport for ReqwestHttp {
	fn request(&self, request: HttpRequest) -> PendingResponse {
		let client = self.client.clone();
		let exchange = async move {
			let mut builder = client.request(to_method(request.method)?, &request.url);
			for (name, value) in &request.headers {
				builder = builder.header(name.as_str(), value.as_str());
			}
			if let Some(body) = request.body {
				builder = builder.body(body);
			}

			let response = builder.send().await.map_err(network)?;
			let status = response.status().as_u16();
			let headers = response
				.headers()
				.iter()
				.filter_map(|(name, value)| {
					value
						.to_str()
						.ok()
						.map(|v| (name.as_str().to_string(), v.to_string()))
				})
				.collect();
			let body = response.text().await.map_err(network)?;
			debug!(status, "HTTP request completed");
			Ok::<_, PlatformError>(HttpResponse {
				status,
				headers,
				body,
			})
		};

		let (exchange, handle) = abortable(exchange);
		PendingResponse {
			response: async move { exchange.await.unwrap_or(Err(PlatformError::Cancelled)) }.boxed(),
			cancel: Some(Box::new(move || handle.abort())),
		}
	}
}

/// Fire-and-forget GET used for the image-request fallback.
#[derive(Debug, Clone)]
pub struct ReqwestImageLoader {
	client: Client,
}

impl ReqwestImageLoader {
	pub fn with_client(client: Client) -> Self {
		Self { client }
	}
}

impl ImageLoader for ReqwestImageLoader {
	fn load(&self, url: &str) -> BoxFuture<'static, bool> {
		let request = self.client.get(url);
		async move {
			match request.send().await {
				Ok(response) => response.status().is_success(),
				Err(e) => {
					debug!(error = %e, "Image request failed");
					false
				}
			}
		}
		.boxed()
	}
}

/// Server-sent events subscription over `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestStream {
	client: Client,
}

impl ReqwestStream {
	pub fn new() -> Result<Self, FlagsError> {
		let client = build_client(flagwire_common_http::builder().connect_timeout(CONNECT_TIMEOUT))?;
		Ok(Self { client })
	}

	pub fn with_client(client: Client) -> Self {
		Self { client }
	}
}

#[async_trait]
impl StreamTransport for ReqwestStream {
	async fn open(&self, request: StreamRequest) -> Result<EventStream, PlatformError> {
		let mut builder = self
			.client
			.request(to_method(request.method)?, &request.url)
			.header("Accept", "text/event-stream")
			.header("Cache-Control", "no-cache");
		if let Some(body) = request.body {
			builder = builder.header("Content-Type", "application/json").body(body);
		}

		let response = builder.send().await.map_err(network)?;
		if !response.status().is_success() {
			return Err(PlatformError::Network(format!(
				"stream request returned {}",
				response.status()
			)));
		}

		let events = response.bytes_stream().eventsource().map(|item| match item {
			Ok(event) => Ok(StreamEvent {
				name: event.event,
				data: event.data,
			}),
			Err(e) => Err(PlatformError::Network(e.to_string())),
		});
		Ok(events.boxed())
	}

	fn supports_report(&self) -> bool {
		true
	}
}

/// Process-local key-value store.
#[derive(Debug, Default)]
pub struct MemoryStore {
	entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl KeyValueStore for MemoryStore {
	async fn get(&self, key: &str) -> Result<Option<String>, PlatformError> {
		Ok(self.entries.lock().get(key).cloned())
	}

	async fn set(&self, key: &str, value: &str) -> Result<(), PlatformError> {
		self.entries.lock().insert(key.to_string(), value.to_string());
		Ok(())
	}

	async fn clear(&self, key: &str) -> Result<(), PlatformError> {
		self.entries.lock().remove(key);
		Ok(())
	}
}

/// A platform with HTTP, image, stream and in-memory storage capabilities.
pub fn default_platform() -> Result<Platform, FlagsError> {
	let http = ReqwestHttp::new()?;
	let images = ReqwestImageLoader::with_client(http.client.clone());
	Ok(Platform::new()
		.with_http(Arc::new(http))
		.with_image_loader(Arc::new(images))
		.with_stream(Arc::new(ReqwestStream::new()?))
		.with_store(Arc::new(MemoryStore::new())))
}
