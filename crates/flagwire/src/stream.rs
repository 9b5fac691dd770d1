// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Live flag updates pushed by the streaming service.
//!
//! A [`LiveChannel`] keeps at most one subscription open. When the
//! subscription fails or ends it is reopened after a fixed delay until
//! [`LiveChannel::disconnect`] is called.

use std::sync::Arc;
use std::time::Duration;

use flagwire_common_http::base64url;
use flagwire_core::platform::{StreamEvent, StreamRequest};
use flagwire_core::{
	EvaluationContext, FlagsError, HttpMethod, Platform, Result, StreamMessage, StreamTransport,
};
use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handles one parsed message. Messages are handled one at a time, in order.
pub type MessageHandler = Arc<dyn Fn(StreamMessage) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
	Connecting,
	Open,
	Closed,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
	pub stream_url: String,
	pub environment: String,
	pub use_report: bool,
	pub with_reasons: bool,
	pub reconnect_delay: Duration,
}

#[derive(Debug)]
struct StreamTask {
	shutdown_tx: mpsc::Sender<()>,
	handle: JoinHandle<()>,
}

impl StreamTask {
	fn stop(self) {
		let _ = self.shutdown_tx.try_send(());
		self.handle.abort();
	}
}

/// Manages the live update subscription.
pub struct LiveChannel {
	platform: Platform,
	config: StreamConfig,
	runtime: Handle,
	state: Arc<Mutex<ReadyState>>,
	task: Mutex<Option<StreamTask>>,
}

impl std::fmt::Debug for LiveChannel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LiveChannel")
			.field("config", &self.config)
			.field("state", &*self.state.lock())
			.finish_non_exhaustive()
	}
}

impl LiveChannel {
	pub fn new(platform: Platform, config: StreamConfig, runtime: Handle) -> Self {
		Self {
			platform,
			config,
			runtime,
			state: Arc::new(Mutex::new(ReadyState::Closed)),
			task: Mutex::new(None),
		}
	}

	/// Opens a subscription for `context`, replacing any existing one.
	///
	/// A reconnect that was waiting out its delay is cancelled and the new
	/// subscription opens immediately.
	pub fn connect(
		&self,
		context: &EvaluationContext,
		hash: Option<&str>,
		handler: MessageHandler,
	) -> Result<()> {
		self.stop_task();

		let transport = self
			.platform
			.stream()
			.cloned()
			.ok_or_else(|| FlagsError::Stream("streaming is not available on this platform".into()))?;
		let request = self.build_request(transport.as_ref(), context, hash)?;

		*self.state.lock() = ReadyState::Connecting;
		let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
		let handle = self.runtime.spawn(run_stream_loop(
			transport,
			request,
			self.config.reconnect_delay,
			Arc::clone(&self.state),
			handler,
			shutdown_rx,
		));
		*self.task.lock() = Some(StreamTask {
			shutdown_tx,
			handle,
		});
		Ok(())
	}

	/// Closes the subscription. It stays closed until the next `connect`.
	pub fn disconnect(&self) {
		if self.stop_task() {
			info!("Flag stream disconnected");
		}
		*self.state.lock() = ReadyState::Closed;
	}

	/// Whether a subscription is open or being (re)established.
	pub fn is_connected(&self) -> bool {
		self.task.lock().is_some() && self.ready_state() != ReadyState::Closed
	}

	pub fn ready_state(&self) -> ReadyState {
		*self.state.lock()
	}

	fn stop_task(&self) -> bool {
		match self.task.lock().take() {
			Some(task) => {
				task.stop();
				true
			}
			None => false,
		}
	}

	fn build_request(
		&self,
		transport: &dyn StreamTransport,
		context: &EvaluationContext,
		hash: Option<&str>,
	) -> Result<StreamRequest> {
		let body =
			serde_json::to_string(context).map_err(|e| FlagsError::InvalidContext(e.to_string()))?;

		let mut params = Vec::new();
		if let Some(hash) = hash.filter(|h| !h.is_empty()) {
			params.push(format!("h={hash}"));
		}
		if self.config.with_reasons {
			params.push("withReasons=true".to_string());
		}
		let query = if params.is_empty() {
			String::new()
		} else {
			format!("?{}", params.join("&"))
		};

		let base = &self.config.stream_url;
		let env = &self.config.environment;
		let request = if !self.config.use_report {
			StreamRequest {
				url: format!("{base}/eval/{env}/{}{query}", base64url(&body)),
				method: HttpMethod::Get,
				body: None,
			}
		} else if transport.supports_report() {
			StreamRequest {
				url: format!("{base}/eval/{env}{query}"),
				method: HttpMethod::Report,
				body: Some(body),
			}
		} else {
			StreamRequest {
				url: format!("{base}/ping/{env}{query}"),
				method: HttpMethod::Get,
				body: None,
			}
		};
		Ok(request)
	}
}

impl Drop for LiveChannel {
	fn drop(&mut self) {
		if let Some(task) = self.task.get_mut().take() {
			task.handle.abort();
		}
	}
}

async fn run_stream_loop(
	transport: Arc<dyn StreamTransport>,
	request: StreamRequest,
	reconnect_delay: Duration,
	state: Arc<Mutex<ReadyState>>,
	handler: MessageHandler,
	mut shutdown_rx: mpsc::Receiver<()>,
) {
	loop {
		if shutdown_rx.try_recv().is_ok() {
			break;
		}

		*state.lock() = ReadyState::Connecting;
		debug!(url = %request.url, method = %request.method, "Connecting to flag stream");

		match transport.open(request.clone()).await {
			Ok(mut events) => {
				*state.lock() = ReadyState::Open;
				info!("Flag stream connected");
				while let Some(item) = events.next().await {
					match item {
						Ok(event) => dispatch(&handler, event).await,
						Err(e) => {
							warn!(error = %e, "Flag stream failed");
							break;
						}
					}
				}
			}
			Err(e) => warn!(error = %e, "Failed to open flag stream"),
		}

		*state.lock() = ReadyState::Connecting;
		debug!(delay_ms = reconnect_delay.as_millis() as u64, "Reconnecting to flag stream");

		tokio::select! {
			_ = tokio::time::sleep(reconnect_delay) => {}
			_ = shutdown_rx.recv() => break,
		}
	}
}

async fn dispatch(handler: &MessageHandler, event: StreamEvent) {
	match StreamMessage::parse(&event.name, &event.data) {
		Ok(Some(message)) => {
			debug!(message = message.name(), "Received stream message");
			handler(message).await;
		}
		Ok(None) => debug!(name = %event.name, "Ignoring unknown stream message"),
		Err(e) => warn!(name = %event.name, error = %e, "Skipping malformed stream message"),
	}
}
