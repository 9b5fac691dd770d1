// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The public flags client.
//!
//! [`FlagsClient`] ties the identity manager, requestor, live channel, flag
//! store and event processor together. Build one with [`FlagsClient::builder`]:
//!
//! ```ignore
//! use flagwire::{EvaluationContext, FlagsClient};
//! use serde_json::json;
//!
//! let client = FlagsClient::builder()
//!     .environment("env-123")
//!     .context(EvaluationContext::new("user-42"))
//!     .build()
//!     .await?;
//!
//! if client.variation("new-checkout", json!(false)) == json!(true) {
//!     // ...
//! }
//! client.close().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use flagwire_core::format::read_bootstrap;
use flagwire_core::{
	AnalyticsEvent, ChangeSet, CustomEvent, EvaluationContext, EvaluationDetail, FeatureEvent,
	FlagValues, FlagsError, Goal, IdentifyEvent, Platform, Result, StreamMessage,
};
use flagwire_events::{DedupCache, ErrorReporter, EventProcessor, EventSender};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::emitter::{
	change_event_for, is_change_event, ClientEvent, Emitter, Listener, ListenerId, CHANGE, FAILED,
	INITIALIZED, READY,
};
use crate::identity::IdentityManager;
use crate::persistence::PersistentFlagCache;
use crate::platform::default_platform;
use crate::requestor::Requestor;
use crate::store::FlagStore;
use crate::stream::{LiveChannel, MessageHandler, StreamConfig};

/// Builder for constructing a [`FlagsClient`].
pub struct FlagsClientBuilder {
	environment: Option<String>,
	context: Option<EvaluationContext>,
	hash: Option<String>,
	config: ClientConfig,
	platform: Option<Platform>,
	listeners: Vec<(String, Listener)>,
	read_env: bool,
}

impl FlagsClientBuilder {
	pub fn new() -> Self {
		Self {
			environment: None,
			context: None,
			hash: None,
			config: ClientConfig::default(),
			platform: None,
			listeners: Vec::new(),
			read_env: false,
		}
	}

	/// Sets the environment (client-side id) flags are fetched for.
	pub fn environment(mut self, environment: impl Into<String>) -> Self {
		self.environment = Some(environment.into());
		self
	}

	/// Sets the context evaluated at startup.
	pub fn context(mut self, context: EvaluationContext) -> Self {
		self.context = Some(context);
		self
	}

	/// Sets the secure-mode hash for the initial context.
	pub fn hash(mut self, hash: impl Into<String>) -> Self {
		self.hash = Some(hash.into());
		self
	}

	/// Replaces the whole configuration.
	pub fn config(mut self, config: ClientConfig) -> Self {
		self.config = config;
		self
	}

	/// Sets the host capabilities. Defaults to [`default_platform`].
	pub fn platform(mut self, platform: Platform) -> Self {
		self.platform = Some(platform);
		self
	}

	pub fn base_url(mut self, url: impl Into<String>) -> Self {
		self.config.base_url = url.into();
		self
	}

	pub fn events_url(mut self, url: impl Into<String>) -> Self {
		self.config.events_url = url.into();
		self
	}

	pub fn stream_url(mut self, url: impl Into<String>) -> Self {
		self.config.stream_url = url.into();
		self
	}

	/// Sends the context as a REPORT body instead of in the URL.
	pub fn use_report(mut self, enable: bool) -> Self {
		self.config.use_report = enable;
		self
	}

	pub fn evaluation_reasons(mut self, enable: bool) -> Self {
		self.config.evaluation_reasons = enable;
		self
	}

	pub fn send_events(mut self, enable: bool) -> Self {
		self.config.send_events = enable;
		self
	}

	pub fn all_attributes_private(mut self, enable: bool) -> Self {
		self.config.all_attributes_private = enable;
		self
	}

	pub fn private_attribute_names<I, S>(mut self, names: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.private_attribute_names = names.into_iter().map(Into::into).collect();
		self
	}

	pub fn inline_users_in_events(mut self, enable: bool) -> Self {
		self.config.inline_users_in_events = enable;
		self
	}

	pub fn allow_frequent_duplicate_events(mut self, enable: bool) -> Self {
		self.config.allow_frequent_duplicate_events = enable;
		self
	}

	pub fn send_events_only_for_variation(mut self, enable: bool) -> Self {
		self.config.send_events_only_for_variation = enable;
		self
	}

	/// Sets the automatic flush interval. Values under two seconds are raised.
	pub fn flush_interval(mut self, interval: Duration) -> Self {
		self.config.flush_interval = interval;
		self
	}

	pub fn sampling_interval(mut self, interval: u32) -> Self {
		self.config.sampling_interval = interval;
		self
	}

	pub fn event_capacity(mut self, capacity: usize) -> Self {
		self.config.event_capacity = capacity;
		self
	}

	pub fn stream_reconnect_delay(mut self, delay: Duration) -> Self {
		self.config.stream_reconnect_delay = delay;
		self
	}

	/// `Some` forces streaming on or off; `None` streams while change
	/// listeners are registered.
	pub fn streaming(mut self, streaming: Option<bool>) -> Self {
		self.config.streaming = streaming;
		self
	}

	/// Persists flag tables per context and starts from them on the next launch.
	pub fn persist_flags(mut self, enable: bool) -> Self {
		self.config.persist_flags = enable;
		self
	}

	/// Starts from server-rendered flag state instead of fetching.
	pub fn bootstrap(mut self, data: Map<String, Value>) -> Self {
		self.config.bootstrap = Some(data);
		self
	}

	/// Overlays `FLAGWIRE_*` environment variables at build time.
	pub fn from_env(mut self) -> Self {
		self.read_env = true;
		self
	}

	/// Registers a listener before startup, so it sees `ready`,
	/// `initialized` and `failed`.
	pub fn on<F>(mut self, event: impl Into<String>, listener: F) -> Self
	where
		F: Fn(&ClientEvent) + Send + Sync + 'static,
	{
		self.listeners.push((event.into(), Arc::new(listener)));
		self
	}

	/// Builds the client and waits for startup to finish.
	///
	/// A failed initial fetch does not fail the build; the client starts in
	/// the failed state with an empty table and reports the error.
	pub async fn build(self) -> Result<FlagsClient> {
		let environment = self
			.environment
			.filter(|e| !e.is_empty())
			.ok_or_else(|| FlagsError::InvalidArgument("an environment id is required".into()))?;
		let context = self
			.context
			.ok_or_else(|| FlagsError::InvalidContext("an initial context is required".into()))?;
		let runtime = Handle::try_current().map_err(|_| {
			FlagsError::InvalidArgument("the flags client must be built inside a tokio runtime".into())
		})?;
		let platform = match self.platform {
			Some(platform) => platform,
			None => default_platform()?,
		};

		let mut config = self.config;
		let mut config_errors = if self.read_env {
			config.apply_env()
		} else {
			Vec::new()
		};
		let (config, corrections) = config.validate();
		config_errors.extend(corrections);

		let emitter = Arc::new(Emitter::new());
		for (event, listener) in self.listeners {
			emitter.on(&event, listener);
		}

		let inner = ClientInner::new(environment, config, platform, runtime, emitter);
		for error in config_errors {
			inner.emitter.maybe_report_error(error);
		}
		if let Some(events) = &inner.events {
			events.start();
		}

		inner.initialize(context, self.hash).await;
		Ok(FlagsClient { inner })
	}
}

impl Default for FlagsClientBuilder {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Debug, Clone, PartialEq)]
enum Readiness {
	Pending,
	Succeeded,
	Failed(FlagsError),
}

#[derive(Debug, Default)]
struct StreamingState {
	forced: Option<bool>,
	active: bool,
}

struct ClientInner {
	environment: String,
	config: ClientConfig,
	platform: Platform,
	runtime: Handle,
	identity: IdentityManager,
	requestor: Requestor,
	stream: LiveChannel,
	store: FlagStore,
	cache: Option<PersistentFlagCache>,
	emitter: Arc<Emitter>,
	events: Option<Arc<EventProcessor>>,
	dedup: Mutex<DedupCache>,
	hash: RwLock<Option<String>>,
	streaming: Mutex<StreamingState>,
	readiness: watch::Sender<Readiness>,
	initialized: AtomicBool,
	closed: AtomicBool,
}

impl ClientInner {
	fn new(
		environment: String,
		config: ClientConfig,
		platform: Platform,
		runtime: Handle,
		emitter: Arc<Emitter>,
	) -> Arc<Self> {
		Arc::new_cyclic(|weak: &Weak<ClientInner>| {
			let on_context_change = {
				let weak = weak.clone();
				Box::new(move |context: &EvaluationContext| {
					if let Some(inner) = weak.upgrade() {
						inner.record_identify(context);
					}
				})
			};
			let identity =
				IdentityManager::new(platform.store().cloned()).with_on_change(on_context_change);

			let requestor = Requestor::new(
				platform.clone(),
				config.base_url.clone(),
				environment.clone(),
				config.use_report,
				config.evaluation_reasons,
			);
			let stream = LiveChannel::new(
				platform.clone(),
				StreamConfig {
					stream_url: config.stream_url.clone(),
					environment: environment.clone(),
					use_report: config.use_report,
					with_reasons: config.evaluation_reasons,
					reconnect_delay: config.stream_reconnect_delay,
				},
				runtime.clone(),
			);
			let cache = if config.persist_flags {
				platform
					.store()
					.cloned()
					.map(|store| PersistentFlagCache::new(store, environment.clone()))
			} else {
				None
			};
			let events = config.send_events.then(|| {
				let reporter_emitter = Arc::clone(&emitter);
				let reporter: ErrorReporter =
					Arc::new(move |error| reporter_emitter.maybe_report_error(error));
				let sender = EventSender::new(platform.clone(), &config.events_url, &environment);
				Arc::new(EventProcessor::new(
					config.processor_config(),
					Arc::new(sender),
					Arc::clone(platform.probes()),
					reporter,
				))
			});
			let forced = config.streaming;
			let (readiness, _) = watch::channel(Readiness::Pending);

			ClientInner {
				environment,
				config,
				platform,
				runtime,
				identity,
				requestor,
				stream,
				store: FlagStore::new(),
				cache,
				emitter,
				events,
				dedup: Mutex::new(DedupCache::default()),
				hash: RwLock::new(None),
				streaming: Mutex::new(StreamingState {
					forced,
					active: false,
				}),
				readiness,
				initialized: AtomicBool::new(false),
				closed: AtomicBool::new(false),
			}
		})
	}

	async fn initialize(self: &Arc<Self>, context: EvaluationContext, hash: Option<String>) {
		*self.hash.write() = hash.clone();
		let context = match self.identity.set_context(context).await {
			Ok(context) => context,
			Err(e) => {
				self.signal_failure(e);
				return;
			}
		};

		if let Some(bootstrap) = self.config.bootstrap.clone() {
			self.store.load(read_bootstrap(bootstrap));
			self.signal_success();
			return;
		}

		if let Some(cache) = &self.cache {
			if let Some(table) = cache.load(&context).await {
				self.store.load(table);
				self.signal_success();
				let inner = Arc::clone(self);
				self.runtime.spawn(async move { inner.refresh().await });
				return;
			}
		}

		match self.requestor.fetch_flag_settings(&context, hash.as_deref()).await {
			Ok(table) => {
				self.store.replace_all(table);
				self.persist().await;
				self.signal_success();
			}
			Err(e) => {
				self.store.clear();
				self.signal_failure(e);
			}
		}
	}

	fn signal_success(self: &Arc<Self>) {
		info!(
			environment = %self.environment,
			flags = self.store.len(),
			"Flags client initialized"
		);
		self.initialized.store(true, Ordering::SeqCst);
		self.readiness.send_replace(Readiness::Succeeded);
		self.emitter.emit(INITIALIZED, &ClientEvent::Initialized);
		self.emitter.emit(READY, &ClientEvent::Ready);
		self.update_streaming();
	}

	fn signal_failure(&self, error: FlagsError) {
		warn!(error = %error, "Flags client failed to initialize");
		self.readiness.send_replace(Readiness::Failed(error.clone()));
		self.emitter.emit(FAILED, &ClientEvent::Failed(error.clone()));
		self.emitter.emit(READY, &ClientEvent::Ready);
		self.emitter.maybe_report_error(error);
	}

	/// Refetches flags for the current context and applies the result.
	async fn refresh(&self) {
		let Some(context) = self.identity.context() else {
			return;
		};
		let hash = self.hash.read().clone();
		match self.requestor.fetch_flag_settings(&context, hash.as_deref()).await {
			Ok(table) => {
				if self.closed.load(Ordering::SeqCst) {
					return;
				}
				let changes = self.store.replace_all(table);
				self.handle_changes(changes).await;
			}
			Err(e) => self.emitter.maybe_report_error(e),
		}
	}

	/// Notifies listeners, persists, then records change-driven feature events.
	async fn handle_changes(&self, changes: ChangeSet) {
		if !changes.is_empty() {
			for (key, change) in &changes {
				self.emitter.emit(
					&change_event_for(key),
					&ClientEvent::FlagChanged {
						key: key.clone(),
						current: change.current_value(),
						previous: change.previous.clone(),
					},
				);
			}
			self.emitter.emit(CHANGE, &ClientEvent::Change(changes.clone()));
		}

		self.persist().await;

		if self.config.send_events_only_for_variation {
			return;
		}
		for (key, change) in &changes {
			let detail = change
				.current
				.clone()
				.unwrap_or_else(|| EvaluationDetail::not_found(Value::Null));
			self.record_feature(key, &detail, Value::Null, false);
		}
	}

	async fn persist(&self) {
		let (Some(cache), Some(context)) = (&self.cache, self.identity.context()) else {
			return;
		};
		cache.save(&context, &self.store.snapshot()).await;
	}

	async fn handle_stream_message(&self, message: StreamMessage) {
		if self.closed.load(Ordering::SeqCst) {
			return;
		}
		match message {
			StreamMessage::Ping => self.refresh().await,
			StreamMessage::Put(table) => {
				let changes = self.store.replace_all(table);
				self.handle_changes(changes).await;
			}
			StreamMessage::Patch(patch) => {
				if let Some(changes) = self.store.apply_patch(&patch.key, patch.descriptor) {
					self.handle_changes(changes).await;
				}
			}
			StreamMessage::Delete(delete) => {
				if let Some(changes) = self.store.apply_delete(&delete.key, delete.version) {
					self.handle_changes(changes).await;
				}
			}
		}
	}

	fn stream_handler(self: &Arc<Self>) -> MessageHandler {
		let weak = Arc::downgrade(self);
		Arc::new(move |message: StreamMessage| {
			let weak = weak.clone();
			async move {
				if let Some(inner) = weak.upgrade() {
					inner.handle_stream_message(message).await;
				}
			}
			.boxed()
		})
	}

	/// Opens or closes the live channel to match the forced setting or, when
	/// automatic, the presence of change listeners.
	fn update_streaming(self: &Arc<Self>) {
		if self.closed.load(Ordering::SeqCst) || !self.initialized.load(Ordering::SeqCst) {
			return;
		}
		let forced = self.streaming.lock().forced;
		let wanted = forced.unwrap_or_else(|| self.emitter.has_change_listeners());
		let active = self.streaming.lock().active;

		if wanted && !active {
			self.connect_stream();
		} else if !wanted && active {
			self.stream.disconnect();
			self.streaming.lock().active = false;
		}
	}

	fn connect_stream(self: &Arc<Self>) {
		let Some(context) = self.identity.context() else {
			return;
		};
		let hash = self.hash.read().clone();
		match self.stream.connect(&context, hash.as_deref(), self.stream_handler()) {
			Ok(()) => {
				self.streaming.lock().active = true;
				debug!(context_key = %context.key_or_empty(), "Streaming flag updates");
			}
			Err(e) => self.emitter.maybe_report_error(e),
		}
	}

	/// The processor to record into, if events may be recorded right now.
	fn event_sink(&self) -> Option<&Arc<EventProcessor>> {
		if self.closed.load(Ordering::SeqCst) || self.platform.probes().do_not_track() {
			return None;
		}
		self.events.as_ref()
	}

	fn record_identify(&self, context: &EvaluationContext) {
		let Some(events) = self.event_sink() else {
			return;
		};
		events.enqueue(AnalyticsEvent::Identify(IdentifyEvent {
			creation_date: self.platform.now_millis(),
			context: context.clone(),
		}));
	}

	fn record_feature(&self, key: &str, detail: &EvaluationDetail, default: Value, with_reason: bool) {
		let Some(events) = self.event_sink() else {
			return;
		};
		let Some(context) = self.identity.context() else {
			return;
		};
		let now = self.platform.now_millis();

		if !self.config.allow_frequent_duplicate_events {
			let cache_key = DedupCache::cache_key(&detail.value, context.key_or_empty(), key);
			if !self.dedup.lock().check_and_record(cache_key, now) {
				return;
			}
		}

		let descriptor = self.store.get(key);
		let track_reason = descriptor.as_ref().is_some_and(|d| d.track_reason);
		events.enqueue(AnalyticsEvent::Feature(FeatureEvent {
			creation_date: now,
			key: key.to_string(),
			context,
			value: detail.value.clone(),
			variation: detail.variation_index,
			default,
			version: descriptor.as_ref().and_then(|d| d.event_version()),
			reason: if with_reason || track_reason {
				detail.reason.clone()
			} else {
				None
			},
			track_events: descriptor.as_ref().is_some_and(|d| d.track_events),
			debug_events_until_date: descriptor.as_ref().and_then(|d| d.debug_events_until_date),
		}));
	}
}

/// Client for evaluating feature flags for one context at a time.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct FlagsClient {
	inner: Arc<ClientInner>,
}

impl std::fmt::Debug for FlagsClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FlagsClient")
			.field("environment", &self.inner.environment)
			.field("flags", &self.inner.store.len())
			.field("closed", &self.inner.closed.load(Ordering::SeqCst))
			.finish_non_exhaustive()
	}
}

impl FlagsClient {
	pub fn builder() -> FlagsClientBuilder {
		FlagsClientBuilder::new()
	}

	/// Returns the flag value for `key`, or `default` if the flag is unknown.
	///
	/// This is a synchronous in-memory lookup.
	pub fn variation(&self, key: &str, default: Value) -> Value {
		self.evaluate(key, default, false).value
	}

	/// Like [`variation`](Self::variation), also returning the variation index
	/// and evaluation reason.
	pub fn variation_detail(&self, key: &str, default: Value) -> EvaluationDetail {
		self.evaluate(key, default, true)
	}

	fn evaluate(&self, key: &str, default: Value, with_reason: bool) -> EvaluationDetail {
		let detail = self.inner.store.evaluate(key, default.clone());
		self.inner.record_feature(key, &detail, default, with_reason);
		detail
	}

	/// Values of every known flag.
	pub fn all_flags(&self) -> FlagValues {
		let record = !self.inner.config.send_events_only_for_variation;
		self.inner
			.store
			.all_keys()
			.into_iter()
			.map(|key| {
				let detail = self.inner.store.evaluate(&key, Value::Null);
				if record {
					self.inner.record_feature(&key, &detail, Value::Null, false);
				}
				(key, detail.value)
			})
			.collect()
	}

	/// Records a custom event for the current context.
	///
	/// An empty key is reported on the error channel and nothing is recorded.
	pub fn track(&self, key: &str, data: Option<Value>, metric_value: Option<f64>) {
		if key.is_empty() {
			self.inner
				.emitter
				.maybe_report_error(FlagsError::InvalidEventKey(key.to_string()));
			return;
		}
		let Some(events) = self.inner.event_sink() else {
			return;
		};
		let Some(context) = self.inner.identity.context() else {
			return;
		};
		events.enqueue(AnalyticsEvent::Custom(CustomEvent {
			creation_date: self.inner.platform.now_millis(),
			key: key.to_string(),
			context,
			data,
			metric_value,
			url: self.inner.platform.probes().current_url(),
		}));
	}

	/// Switches to `context` and returns its flag values.
	///
	/// The context only changes once its flags have been fetched. On failure
	/// the error is returned and reported, and the previous context and table
	/// stay in place.
	pub async fn identify(&self, context: EvaluationContext, hash: Option<String>) -> Result<FlagValues> {
		let inner = &self.inner;
		if inner.closed.load(Ordering::SeqCst) {
			return Err(FlagsError::ClientClosed);
		}

		if let (Some(cache), Some(previous)) = (&inner.cache, inner.identity.context()) {
			cache.clear(&previous).await;
		}

		let result = async {
			let sanitized = inner.identity.sanitize(context).await?;
			let table = inner
				.requestor
				.fetch_flag_settings(&sanitized, hash.as_deref())
				.await?;
			Ok::<_, FlagsError>((sanitized, table))
		}
		.await;
		let (sanitized, table) = match result {
			Ok(fetched) => fetched,
			Err(e) => {
				inner.emitter.maybe_report_error(e.clone());
				return Err(e);
			}
		};

		let context = inner.identity.set_context(sanitized).await?;
		*inner.hash.write() = hash;
		let changes = inner.store.replace_all(table);
		inner.handle_changes(changes).await;

		let streaming = inner.streaming.lock().active;
		if streaming {
			inner.connect_stream();
		}
		debug!(context_key = %context.key_or_empty(), "Identified context");
		Ok(inner.store.values())
	}

	/// Registers a listener. Registering for `change` or `change:<key>` may
	/// start streaming.
	pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
	where
		F: Fn(&ClientEvent) + Send + Sync + 'static,
	{
		let id = self.inner.emitter.on(event, Arc::new(listener));
		if is_change_event(event) {
			self.inner.update_streaming();
		}
		id
	}

	/// Removes a listener. Removing the last change listener may stop streaming.
	pub fn off(&self, event: &str, id: ListenerId) -> bool {
		let removed = self.inner.emitter.off(event, id);
		if removed && is_change_event(event) {
			self.inner.update_streaming();
		}
		removed
	}

	/// Forces streaming on or off, or with `None` returns to following the
	/// change listeners.
	pub fn set_streaming(&self, streaming: Option<bool>) {
		{
			let mut state = self.inner.streaming.lock();
			if state.forced == streaming {
				return;
			}
			state.forced = streaming;
		}
		self.inner.update_streaming();
	}

	pub fn is_streaming(&self) -> bool {
		self.inner.stream.is_connected()
	}

	/// Delivers queued events now.
	pub async fn flush(&self) {
		if let Some(events) = &self.inner.events {
			events.flush(false).await;
		}
	}

	/// Stops streaming and the flush timer and sends remaining events.
	///
	/// Afterwards flag reads return defaults and event recording does nothing.
	/// Calling it again has no effect.
	pub async fn close(&self) {
		let inner = &self.inner;
		if inner.closed.swap(true, Ordering::SeqCst) {
			return;
		}

		inner.stream.disconnect();
		inner.streaming.lock().active = false;
		if let Some(events) = &inner.events {
			events.stop();
			events.flush(true).await;
		}
		inner.store.clear();
		info!("Flags client closed");
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::SeqCst)
	}

	pub fn context(&self) -> Option<EvaluationContext> {
		self.inner.identity.context()
	}

	/// Fetches the goal definitions for the environment.
	pub async fn goals(&self) -> Result<Vec<Goal>> {
		self.inner.requestor.fetch_goals().await.map_err(|e| {
			self.inner.emitter.maybe_report_error(e.clone());
			e
		})
	}

	/// Resolves once startup has finished, successfully or not.
	pub async fn wait_until_ready(&self) {
		let mut readiness = self.inner.readiness.subscribe();
		let _ = readiness.wait_for(|r| *r != Readiness::Pending).await;
	}

	/// Resolves once startup has finished, returning the startup error if it failed.
	pub async fn wait_for_initialization(&self) -> Result<()> {
		let mut readiness = self.inner.readiness.subscribe();
		let state = readiness
			.wait_for(|r| *r != Readiness::Pending)
			.await
			.map(|r| (*r).clone())
			.map_err(|_| FlagsError::ClientClosed)?;
		match state {
			Readiness::Failed(e) => Err(e),
			_ => Ok(()),
		}
	}

	/// Whether startup produced a usable flag table.
	pub fn is_initialized(&self) -> bool {
		self.inner.initialized.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::emitter::ERROR;
	use crate::persistence::PersistentFlagCache;
	use crate::platform::MemoryStore;
	use crate::requestor::testing::{json, FixedHttp};
	use crate::stream::testing::{event, ScriptedStream};
	use flagwire_core::{FlagDescriptor, HttpMethod, KeyValueStore, Probes};
	use serde_json::json as value;

	const FLAGS: &str = r#"{
		"beta": {"value": true, "version": 3, "variation": 1},
		"color": {"value": "red", "version": 1, "variation": 0}
	}"#;

	fn http(body: &str) -> Arc<FixedHttp> {
		Arc::new(FixedHttp::new(Ok(json(200, body))))
	}

	fn recorder() -> (Arc<Mutex<Vec<ClientEvent>>>, impl Fn(&ClientEvent) + Send + Sync + 'static) {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = Arc::clone(&seen);
		(seen, move |event: &ClientEvent| sink.lock().push(event.clone()))
	}

	fn builder(platform: Platform) -> FlagsClientBuilder {
		FlagsClient::builder()
			.environment("env")
			.context(EvaluationContext::new("ann"))
			.platform(platform)
	}

	fn posted_batches(http: &FixedHttp) -> Vec<Vec<Value>> {
		http.requests
			.lock()
			.iter()
			.filter(|r| r.method == HttpMethod::Post)
			.map(|r| serde_json::from_str(r.body.as_deref().unwrap_or("[]")).unwrap())
			.collect()
	}

	fn events_of_kind(batches: &[Vec<Value>], kind: &str) -> Vec<Value> {
		batches
			.iter()
			.flatten()
			.filter(|e| e["kind"] == kind)
			.cloned()
			.collect()
	}

	async fn settle(condition: impl Fn() -> bool) {
		for _ in 0..100 {
			if condition() {
				return;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	}

	#[test]
	fn test_builder_requires_environment() {
		let result = tokio_test::block_on(async {
			FlagsClientBuilder::new()
				.context(EvaluationContext::new("ann"))
				.build()
				.await
		});
		assert!(matches!(result, Err(FlagsError::InvalidArgument(_))));
	}

	#[test]
	fn test_builder_requires_context() {
		let result =
			tokio_test::block_on(async { FlagsClientBuilder::new().environment("env").build().await });
		assert!(matches!(result, Err(FlagsError::InvalidContext(_))));
	}

	#[tokio::test]
	async fn initial_fetch_populates_table_and_signals_ready() {
		let http = http(FLAGS);
		let (seen, listener) = recorder();
		let (ready, ready_listener) = recorder();
		let client = builder(Platform::new().with_http(http.clone()))
			.send_events(false)
			.on(INITIALIZED, listener)
			.on(READY, ready_listener)
			.build()
			.await
			.unwrap();

		client.wait_for_initialization().await.unwrap();
		assert!(client.is_initialized());
		assert_eq!(client.variation("beta", value!(false)), value!(true));
		assert_eq!(client.variation("missing", value!(7)), value!(7));
		assert_eq!(*seen.lock(), vec![ClientEvent::Initialized]);
		assert_eq!(*ready.lock(), vec![ClientEvent::Ready]);

		let requests = http.requests.lock();
		assert_eq!(requests.len(), 1);
		assert!(requests[0].url.contains("/sdk/evalx/env/users/"));
	}

	#[tokio::test]
	async fn failed_fetch_signals_failed_then_ready_and_reports() {
		let http = Arc::new(FixedHttp::new(Ok(json(404, "{}"))));
		let (seen, listener) = recorder();
		let sink = Arc::clone(&seen);
		let client = builder(Platform::new().with_http(http))
			.send_events(false)
			.on(FAILED, listener)
			.on(READY, move |e: &ClientEvent| sink.lock().push(e.clone()))
			.on(ERROR, {
				let sink = Arc::clone(&seen);
				move |e: &ClientEvent| sink.lock().push(e.clone())
			})
			.build()
			.await
			.unwrap();

		assert_eq!(
			client.wait_for_initialization().await,
			Err(FlagsError::EnvironmentNotFound)
		);
		client.wait_until_ready().await;
		assert!(!client.is_initialized());
		assert_eq!(
			*seen.lock(),
			vec![
				ClientEvent::Failed(FlagsError::EnvironmentNotFound),
				ClientEvent::Ready,
				ClientEvent::Error(FlagsError::EnvironmentNotFound),
			]
		);
		assert!(client.all_flags().is_empty());
	}

	#[tokio::test]
	async fn bootstrap_skips_the_initial_fetch() {
		let http = http(FLAGS);
		let bootstrap = value!({
			"beta": "on",
			"$flagsState": {"beta": {"version": 9, "variation": 2}}
		});
		let Value::Object(bootstrap) = bootstrap else {
			unreachable!()
		};
		let client = builder(Platform::new().with_http(http.clone()))
			.send_events(false)
			.bootstrap(bootstrap)
			.build()
			.await
			.unwrap();

		assert!(http.requests.lock().is_empty());
		let detail = client.variation_detail("beta", value!("off"));
		assert_eq!(detail.value, value!("on"));
		assert_eq!(detail.variation_index, Some(2));
	}

	#[tokio::test]
	async fn cached_table_is_used_then_refreshed() {
		let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
		let cached = [("beta".to_string(), FlagDescriptor::new(value!("cached")).with_version(1))]
			.into_iter()
			.collect();
		PersistentFlagCache::new(Arc::clone(&store), "env")
			.save(&EvaluationContext::new("ann"), &cached)
			.await;

		let http = http(r#"{"beta":{"value":"fresh","version":2}}"#);
		let client = builder(Platform::new().with_http(http.clone()).with_store(store))
			.send_events(false)
			.streaming(Some(false))
			.persist_flags(true)
			.build()
			.await
			.unwrap();

		assert!(client.is_initialized());
		assert_eq!(client.variation("beta", Value::Null), value!("cached"));

		settle(|| client.variation("beta", Value::Null) == value!("fresh")).await;
		assert_eq!(client.variation("beta", Value::Null), value!("fresh"));
		assert_eq!(http.requests.lock().len(), 1);
	}

	#[tokio::test]
	async fn identify_switches_context_and_reports_changes() {
		let http = http(FLAGS);
		let client = builder(Platform::new().with_http(http.clone()))
			.send_events(false)
			.streaming(Some(false))
			.build()
			.await
			.unwrap();
		let (changes, listener) = recorder();
		client.on(&change_event_for("beta"), listener);

		http.set(Ok(json(200, r#"{"beta":{"value":false,"version":4}}"#)));
		let values = client
			.identify(EvaluationContext::new("bob"), Some("secret".into()))
			.await
			.unwrap();

		assert_eq!(values.get("beta"), Some(&value!(false)));
		assert!(!values.contains_key("color"));
		assert_eq!(client.context().unwrap().key.as_deref(), Some("bob"));
		assert_eq!(
			*changes.lock(),
			vec![ClientEvent::FlagChanged {
				key: "beta".into(),
				current: value!(false),
				previous: Some(value!(true)),
			}]
		);
		assert!(http.requests.lock()[1].url.ends_with("?h=secret"));
	}

	#[tokio::test]
	async fn failed_identify_keeps_previous_state() {
		let http = http(FLAGS);
		let (errors, listener) = recorder();
		let client = builder(Platform::new().with_http(http.clone()))
			.send_events(false)
			.on(ERROR, listener)
			.build()
			.await
			.unwrap();

		http.set(Ok(json(500, "{}")));
		let result = client.identify(EvaluationContext::new("bob"), None).await;

		let expected = FlagsError::FlagFetch {
			status: Some(500),
			message: "500".into(),
		};
		assert_eq!(result, Err(expected.clone()));
		assert_eq!(*errors.lock(), vec![ClientEvent::Error(expected)]);
		assert_eq!(client.context().unwrap().key.as_deref(), Some("ann"));
		assert_eq!(client.variation("beta", value!(false)), value!(true));
	}

	#[tokio::test]
	async fn identify_rejects_keyless_named_context() {
		let client = builder(Platform::new().with_http(http(FLAGS)))
			.send_events(false)
			.build()
			.await
			.unwrap();
		let result = client
			.identify(EvaluationContext::default().with_name("nobody"), None)
			.await;
		assert!(matches!(result, Err(FlagsError::InvalidContext(_))));
	}

	#[tokio::test]
	async fn anonymous_context_receives_a_key() {
		let client = FlagsClient::builder()
			.environment("env")
			.context(EvaluationContext::anonymous())
			.platform(Platform::new().with_http(http(FLAGS)))
			.send_events(false)
			.build()
			.await
			.unwrap();
		let context = client.context().unwrap();
		assert!(context.is_anonymous());
		assert!(!context.key_or_empty().is_empty());
	}

	#[tokio::test]
	async fn duplicate_evaluations_are_recorded_once() {
		let http = http(FLAGS);
		let client = builder(Platform::new().with_http(http.clone()))
			.build()
			.await
			.unwrap();

		client.variation("beta", value!(false));
		client.variation("beta", value!(false));
		client.flush().await;

		let batches = posted_batches(&http);
		assert_eq!(events_of_kind(&batches, "identify").len(), 1);
		let summaries = events_of_kind(&batches, "summary");
		assert_eq!(summaries.len(), 1);
		assert_eq!(summaries[0]["features"]["beta"]["counters"][0]["count"], value!(1));
		assert_eq!(summaries[0]["features"]["beta"]["counters"][0]["version"], value!(3));
	}

	#[tokio::test]
	async fn frequent_duplicates_can_be_allowed() {
		let http = http(FLAGS);
		let client = builder(Platform::new().with_http(http.clone()))
			.allow_frequent_duplicate_events(true)
			.build()
			.await
			.unwrap();

		client.variation("beta", value!(false));
		client.variation("beta", value!(false));
		client.flush().await;

		let summaries = events_of_kind(&posted_batches(&http), "summary");
		assert_eq!(summaries[0]["features"]["beta"]["counters"][0]["count"], value!(2));
	}

	#[tokio::test]
	async fn all_flags_records_events_unless_restricted_to_variation() {
		let http = http(FLAGS);
		let client = builder(Platform::new().with_http(http.clone()))
			.send_events_only_for_variation(true)
			.build()
			.await
			.unwrap();

		let values = client.all_flags();
		assert_eq!(values.len(), 2);
		assert_eq!(values["color"], value!("red"));
		client.flush().await;
		assert!(events_of_kind(&posted_batches(&http), "summary").is_empty());
	}

	#[tokio::test]
	async fn track_records_custom_events() {
		let http = http(FLAGS);
		let client = builder(Platform::new().with_http(http.clone()))
			.build()
			.await
			.unwrap();

		client.track("checkout", Some(value!({"total": 12})), Some(12.0));
		client.flush().await;

		let custom = events_of_kind(&posted_batches(&http), "custom");
		assert_eq!(custom.len(), 1);
		assert_eq!(custom[0]["key"], value!("checkout"));
		assert_eq!(custom[0]["userKey"], value!("ann"));
		assert_eq!(custom[0]["metricValue"], value!(12.0));
	}

	#[tokio::test]
	async fn empty_event_key_is_reported() {
		let http = http(FLAGS);
		let (errors, listener) = recorder();
		let client = builder(Platform::new().with_http(http.clone()))
			.on(ERROR, listener)
			.build()
			.await
			.unwrap();

		client.track("", None, None);
		client.flush().await;

		assert_eq!(
			*errors.lock(),
			vec![ClientEvent::Error(FlagsError::InvalidEventKey(String::new()))]
		);
		assert!(events_of_kind(&posted_batches(&http), "custom").is_empty());
	}

	struct DoNotTrack;

	impl Probes for DoNotTrack {
		fn now_millis(&self) -> i64 {
			1_000
		}

		fn do_not_track(&self) -> bool {
			true
		}
	}

	#[tokio::test]
	async fn do_not_track_suppresses_all_events() {
		let http = http(FLAGS);
		let client = builder(
			Platform::new()
				.with_http(http.clone())
				.with_probes(Arc::new(DoNotTrack)),
		)
		.build()
		.await
		.unwrap();

		client.variation("beta", value!(false));
		client.track("checkout", None, None);
		client.flush().await;
		assert!(posted_batches(&http).is_empty());
	}

	#[tokio::test]
	async fn invalid_config_is_corrected_and_reported() {
		let (errors, listener) = recorder();
		let client = builder(Platform::new().with_http(http(FLAGS)))
			.send_events(false)
			.flush_interval(Duration::from_millis(100))
			.on(ERROR, listener)
			.build()
			.await
			.unwrap();

		assert!(client.is_initialized());
		let errors = errors.lock();
		assert_eq!(errors.len(), 1);
		assert!(matches!(
			errors[0],
			ClientEvent::Error(FlagsError::InvalidArgument(_))
		));
	}

	#[tokio::test]
	async fn close_flushes_once_and_disables_the_client() {
		let http = http(FLAGS);
		let client = builder(Platform::new().with_http(http.clone()))
			.build()
			.await
			.unwrap();

		client.track("before-close", None, None);
		client.close().await;
		client.close().await;

		assert!(client.is_closed());
		let batches = posted_batches(&http);
		assert_eq!(batches.len(), 1);
		assert_eq!(events_of_kind(&batches, "custom").len(), 1);

		assert_eq!(client.variation("beta", value!("default")), value!("default"));
		assert!(client.all_flags().is_empty());
		client.track("after-close", None, None);
		client.flush().await;
		assert_eq!(posted_batches(&http).len(), 1);
		assert_eq!(
			client.identify(EvaluationContext::new("bob"), None).await,
			Err(FlagsError::ClientClosed)
		);
	}

	#[tokio::test]
	async fn streaming_follows_change_listeners() {
		let stream = Arc::new(ScriptedStream::holding_open());
		let client = builder(
			Platform::new()
				.with_http(http(FLAGS))
				.with_stream(stream.clone()),
		)
		.send_events(false)
		.build()
		.await
		.unwrap();
		assert!(!client.is_streaming());

		let id = client.on(CHANGE, |_: &ClientEvent| {});
		assert!(client.is_streaming());
		assert!(client.off(CHANGE, id));
		assert!(!client.is_streaming());
	}

	#[tokio::test]
	async fn forced_streaming_overrides_listeners() {
		let stream = Arc::new(ScriptedStream::holding_open());
		let client = builder(
			Platform::new()
				.with_http(http(FLAGS))
				.with_stream(stream.clone()),
		)
		.send_events(false)
		.build()
		.await
		.unwrap();

		client.set_streaming(Some(true));
		assert!(client.is_streaming());

		client.on(CHANGE, |_: &ClientEvent| {});
		client.set_streaming(Some(false));
		assert!(!client.is_streaming());

		client.set_streaming(None);
		assert!(client.is_streaming());
	}

	#[tokio::test]
	async fn stream_patch_updates_table_and_notifies() {
		let stream = Arc::new(ScriptedStream::holding_open());
		stream.push_script(vec![
			event("patch", r#"{"key":"beta","value":false,"version":4}"#),
			event("patch", r#"{"key":"beta","value":true,"version":2}"#),
			event("delete", r#"{"key":"color","version":5}"#),
		]);
		let client = builder(
			Platform::new()
				.with_http(http(FLAGS))
				.with_stream(stream.clone()),
		)
		.send_events(false)
		.build()
		.await
		.unwrap();

		let (changes, listener) = recorder();
		client.on(CHANGE, listener);
		settle(|| changes.lock().len() == 2).await;

		let changes = changes.lock();
		assert_eq!(changes.len(), 2);
		assert_eq!(client.variation("beta", Value::Null), value!(false));
		assert_eq!(client.variation("color", value!("none")), value!("none"));
		assert_eq!(stream.open_count(), 1);
	}

	#[tokio::test]
	async fn stream_ping_refetches_flags() {
		let stream = Arc::new(ScriptedStream::holding_open());
		stream.push_script(vec![event("ping", "{}")]);
		let http = http(FLAGS);
		let client = builder(
			Platform::new()
				.with_http(http.clone())
				.with_stream(stream.clone()),
		)
		.send_events(false)
		.build()
		.await
		.unwrap();

		http.set(Ok(json(200, r#"{"beta":{"value":"pinged","version":5}}"#)));
		client.set_streaming(Some(true));
		settle(|| client.variation("beta", Value::Null) == value!("pinged")).await;

		assert_eq!(client.variation("beta", Value::Null), value!("pinged"));
		assert_eq!(http.requests.lock().len(), 2);
	}

	#[tokio::test]
	async fn goal_fetch_errors_are_returned_and_reported() {
		let http = http(FLAGS);
		let (errors, listener) = recorder();
		let client = builder(Platform::new().with_http(http.clone()))
			.send_events(false)
			.on(ERROR, listener)
			.build()
			.await
			.unwrap();

		http.set(Ok(json(404, "{}")));
		assert_eq!(client.goals().await, Err(FlagsError::EnvironmentNotFound));
		assert_eq!(
			*errors.lock(),
			vec![ClientEvent::Error(FlagsError::EnvironmentNotFound)]
		);

		http.set(Ok(json(200, r#"[{"key":"signup","kind":"pageview"}]"#)));
		let goals = client.goals().await.unwrap();
		assert_eq!(goals[0].key, "signup");
	}
}
