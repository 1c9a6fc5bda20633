//! Reconciles the Network and Fetch event streams for one session.
//!
//! Chromium reports one logical request through several streams with
//! no ordering guarantee between them: `Network.requestWillBeSent`,
//! `Fetch.requestPaused` (under interception), response events, their
//! out-of-band extra-info counterparts, and the completion events.
//! The manager pairs them by the stable network request ID, buffers
//! whichever side arrives first, and emits digested [`NetworkEvent`]s
//! in a coherent order.

mod event_manager;
mod request;
mod response;

pub use request::HttpRequest;
pub use response::HttpResponse;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use cdp_protocol::fetch::{
	ContinueRequestParams, EnableParams, RequestPattern, RequestPausedEvent,
};
use cdp_protocol::network::{
	LoadingFailedEvent, LoadingFinishedEvent, RequestServedFromCacheEvent,
	RequestWillBeSentEvent, ResponseReceivedEvent, ResponseReceivedExtraInfoEvent,
};
use cdp_runtime::events::EventBus;
use cdp_runtime::{CdpSession, Error, ProtocolEvent, Result, SessionEvent};

use event_manager::{NetworkEventManager, QueuedEventGroup, RedirectInfo};
use request::RedirectChain;

#[derive(Clone)]
pub enum NetworkEvent {
	Request(Arc<HttpRequest>),
	Response(Arc<HttpResponse>),
	RequestFinished(Arc<HttpRequest>),
	RequestFailed(Arc<HttpRequest>),
	RequestServedFromCache(Arc<HttpRequest>),
}

pub struct NetworkManager {
	session: Arc<CdpSession>,
	state: Mutex<NetworkEventManager>,
	/// Interception was requested through [`set_request_interception`].
	///
	/// [`set_request_interception`]: NetworkManager::set_request_interception
	user_interception: AtomicBool,
	/// The Fetch domain is enabled on the browser side.
	protocol_interception: AtomicBool,
	events: EventBus<NetworkEvent>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkManager {
	pub fn new(session: Arc<CdpSession>) -> Arc<Self> {
		Arc::new(Self {
			session,
			state: Mutex::new(NetworkEventManager::new()),
			user_interception: AtomicBool::new(false),
			protocol_interception: AtomicBool::new(false),
			events: EventBus::new(1024),
			tasks: Mutex::new(Vec::new()),
		})
	}

	/// Enables the Network domain and starts routing session events.
	pub async fn initialize(self: &Arc<Self>) -> Result<()> {
		self.spawn_event_loop();
		self.session
			.send("Network.enable", serde_json::json!({}))
			.await?;
		Ok(())
	}

	pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
		self.events.subscribe()
	}

	pub(crate) fn bus(&self) -> &EventBus<NetworkEvent> {
		&self.events
	}

	pub fn request_interception_enabled(&self) -> bool {
		self.user_interception.load(Ordering::SeqCst)
	}

	/// Toggles request interception. While enabled, every request
	/// pauses until [`HttpRequest::continue_request`] or
	/// [`HttpRequest::abort`] is called on it.
	pub async fn set_request_interception(&self, enabled: bool) -> Result<()> {
		self.user_interception.store(enabled, Ordering::SeqCst);
		if enabled {
			let params = EnableParams {
				patterns: vec![RequestPattern {
					url_pattern: "*".to_string(),
				}],
				handle_auth_requests: false,
			};
			self.session
				.send("Fetch.enable", serde_json::to_value(&params)?)
				.await?;
			self.protocol_interception.store(true, Ordering::SeqCst);
		} else if self.protocol_interception.swap(false, Ordering::SeqCst) {
			self.session
				.send("Fetch.disable", serde_json::json!({}))
				.await?;
		}
		Ok(())
	}

	pub(crate) fn dispose(&self) {
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
	}

	fn spawn_event_loop(self: &Arc<Self>) {
		let weak = Arc::downgrade(self);
		let mut events = self.session.subscribe();
		let task = tokio::spawn(async move {
			loop {
				let event = match events.recv().await {
					Ok(SessionEvent::Event(event)) => event,
					Ok(SessionEvent::Disconnected) => break,
					Err(broadcast::error::RecvError::Lagged(n)) => {
						tracing::warn!(skipped = n, "network event stream lagged");
						continue;
					}
					Err(broadcast::error::RecvError::Closed) => break,
				};
				let Some(manager) = weak.upgrade() else {
					break;
				};
				manager.handle_session_event(&event);
			}
		});
		self.tasks.lock().push(task);
	}

	fn handle_session_event(self: &Arc<Self>, event: &ProtocolEvent) {
		let params = event.params.as_ref();
		match event.method.as_ref() {
			"Network.requestWillBeSent" => {
				if let Ok(e) = serde_json::from_value::<RequestWillBeSentEvent>(params.clone()) {
					self.on_request_will_be_sent(e);
				}
			}
			"Fetch.requestPaused" => {
				if let Ok(e) = serde_json::from_value::<RequestPausedEvent>(params.clone()) {
					self.on_request_paused(e);
				}
			}
			"Network.responseReceived" => {
				if let Ok(e) = serde_json::from_value::<ResponseReceivedEvent>(params.clone()) {
					self.on_response_received(e);
				}
			}
			"Network.responseReceivedExtraInfo" => {
				if let Ok(e) =
					serde_json::from_value::<ResponseReceivedExtraInfoEvent>(params.clone())
				{
					self.on_response_received_extra_info(e);
				}
			}
			"Network.loadingFinished" => {
				if let Ok(e) = serde_json::from_value::<LoadingFinishedEvent>(params.clone()) {
					self.on_loading_finished(e);
				}
			}
			"Network.loadingFailed" => {
				if let Ok(e) = serde_json::from_value::<LoadingFailedEvent>(params.clone()) {
					self.on_loading_failed(e);
				}
			}
			"Network.requestServedFromCache" => {
				if let Ok(e) =
					serde_json::from_value::<RequestServedFromCacheEvent>(params.clone())
				{
					self.on_request_served_from_cache(&e);
				}
			}
			_ => {}
		}
	}

	fn on_request_will_be_sent(self: &Arc<Self>, event: RequestWillBeSentEvent) {
		let network_id = event.request_id.clone();
		// data: URLs never pause, so don't wait for a paired
		// requestPaused under interception.
		let intercepted = self.user_interception.load(Ordering::SeqCst)
			&& !event.request.url.starts_with("data:");
		if !intercepted {
			self.emit_request(event, None);
			return;
		}
		let paused = {
			let mut state = self.state.lock();
			state.store_request_will_be_sent(&network_id, event.clone());
			state.request_paused(&network_id).cloned()
		};
		if let Some(paused) = paused {
			let fetch_id = paused.request_id.clone();
			{
				let mut state = self.state.lock();
				state.forget_request_will_be_sent(&network_id);
				state.forget_request_paused(&network_id);
			}
			let mut event = event;
			event.request.headers.extend(paused.request.headers);
			self.emit_request(event, Some(fetch_id));
		}
	}

	fn on_request_paused(self: &Arc<Self>, event: RequestPausedEvent) {
		// Interception was turned off while the browser still had the
		// Fetch domain active; release the request untouched.
		if !self.user_interception.load(Ordering::SeqCst)
			&& self.protocol_interception.load(Ordering::SeqCst)
		{
			let session = Arc::clone(&self.session);
			let params = ContinueRequestParams {
				request_id: event.request_id.clone(),
			};
			tokio::spawn(async move {
				let params = match serde_json::to_value(&params) {
					Ok(params) => params,
					Err(_) => return,
				};
				if let Err(error) = session.send("Fetch.continueRequest", params).await {
					tracing::debug!(%error, "failed to release paused request");
				}
			});
			return;
		}

		let Some(network_id) = event.network_id.clone() else {
			tracing::debug!(
				fetch_id = %event.request_id,
				"paused request carries no network id, ignoring"
			);
			return;
		};

		let will_be_sent = {
			let state = self.state.lock();
			state.request_will_be_sent(&network_id).cloned()
		};
		match will_be_sent {
			// A stored event for a different URL or method belongs to
			// a superseded redirect hop; this pause starts a new one.
			Some(stored)
				if stored.request.url != event.request.url
					|| stored.request.method != event.request.method =>
			{
				let mut state = self.state.lock();
				state.forget_request_will_be_sent(&network_id);
				state.store_request_paused(&network_id, event);
			}
			Some(mut stored) => {
				let fetch_id = event.request_id.clone();
				{
					let mut state = self.state.lock();
					state.forget_request_will_be_sent(&network_id);
					state.forget_request_paused(&network_id);
				}
				stored.request.headers.extend(event.request.headers);
				self.emit_request(stored, Some(fetch_id));
			}
			None => {
				self.state.lock().store_request_paused(&network_id, event);
			}
		}
	}

	/// Turns a reconciled `requestWillBeSent` into an [`HttpRequest`].
	/// Redirect hops first retire the previous request for the same
	/// network ID, carrying its chain forward.
	fn emit_request(self: &Arc<Self>, event: RequestWillBeSentEvent, fetch_id: Option<String>) {
		let network_id = event.request_id.clone();
		let mut redirect_chain: Option<RedirectChain> = None;

		if let Some(redirect_response) = event.redirect_response.clone() {
			let extra_info = if event.redirect_has_extra_info {
				let extra = self.state.lock().response_extra_info(&network_id).pop_front();
				// The hop's extra-info has not arrived yet; park the
				// whole redirect until it does.
				if extra.is_none() {
					self.state.lock().queue_redirect_info(
						&network_id,
						RedirectInfo {
							event,
							fetch_request_id: fetch_id,
						},
					);
					return;
				}
				extra
			} else {
				None
			};
			let previous = self.state.lock().request(&network_id);
			if let Some(previous) = previous {
				let response = HttpResponse::new(
					Arc::clone(&self.session),
					&network_id,
					&redirect_response,
					extra_info.as_ref(),
				);
				response.resolve_body(Some(Error::Protocol {
					method: "Network.getResponseBody".to_string(),
					message: "Response body is unavailable for redirect responses".to_string(),
				}));
				previous.set_response(Arc::clone(&response));
				let chain = previous.redirect_chain_handle();
				chain.lock().push(Arc::clone(&previous));
				redirect_chain = Some(chain);
				self.state.lock().forget_request(&network_id);
				self.events.emit(NetworkEvent::Response(response));
				self.events.emit(NetworkEvent::RequestFinished(previous));
			}
		}

		let chain = redirect_chain.unwrap_or_default();
		let request = HttpRequest::new(Arc::clone(&self.session), &event, fetch_id, chain);
		self.state.lock().store_request(&network_id, Arc::clone(&request));
		self.events.emit(NetworkEvent::Request(request));
	}

	fn on_response_received(self: &Arc<Self>, event: ResponseReceivedEvent) {
		let network_id = event.request_id.clone();
		let extra_info = {
			let mut state = self.state.lock();
			let request = state.request(&network_id);
			if request.is_some()
				&& !request.as_ref().is_some_and(|r| r.from_memory_cache())
				&& event.has_extra_info
			{
				match state.response_extra_info(&network_id).pop_front() {
					Some(extra) => Some(extra),
					None => {
						// Extra-info is still in flight; hold the
						// response (and any completion events that
						// follow) until it lands.
						state.queue_event_group(
							&network_id,
							QueuedEventGroup {
								response: event,
								loading_finished: None,
								loading_failed: None,
							},
						);
						return;
					}
				}
			} else {
				None
			}
		};
		self.emit_response(&event, extra_info.as_ref());
	}

	fn on_response_received_extra_info(self: &Arc<Self>, event: ResponseReceivedExtraInfoEvent) {
		let network_id = event.request_id.clone();

		// A redirect hop may be waiting on exactly this event.
		let redirect = self.state.lock().take_queued_redirect_info(&network_id);
		if let Some(redirect) = redirect {
			self.state
				.lock()
				.response_extra_info(&network_id)
				.push_back(event);
			self.emit_request(redirect.event, redirect.fetch_request_id);
			return;
		}

		// Or a parked response group.
		let group = self.state.lock().take_queued_event_group(&network_id);
		if let Some(group) = group {
			self.emit_response(&group.response, Some(&event));
			if let Some(finished) = group.loading_finished {
				self.emit_loading_finished(finished);
			}
			if let Some(failed) = group.loading_failed {
				self.emit_loading_failed(failed);
			}
			return;
		}

		self.state
			.lock()
			.response_extra_info(&network_id)
			.push_back(event);
	}

	fn emit_response(
		self: &Arc<Self>,
		event: &ResponseReceivedEvent,
		extra_info: Option<&ResponseReceivedExtraInfoEvent>,
	) {
		let Some(request) = self.state.lock().request(&event.request_id) else {
			return;
		};
		let response = HttpResponse::new(
			Arc::clone(&self.session),
			&event.request_id,
			&event.response,
			extra_info,
		);
		request.set_response(Arc::clone(&response));
		self.events.emit(NetworkEvent::Response(response));
	}

	fn on_loading_finished(self: &Arc<Self>, event: LoadingFinishedEvent) {
		// If the response is parked waiting on extra-info, completion
		// must wait with it to preserve emission order.
		let mut state = self.state.lock();
		if let Some(group) = state.queued_event_group_mut(&event.request_id) {
			group.loading_finished = Some(event);
			return;
		}
		drop(state);
		self.emit_loading_finished(event);
	}

	fn emit_loading_finished(self: &Arc<Self>, event: LoadingFinishedEvent) {
		let request = self.state.lock().request(&event.request_id);
		let Some(request) = request else {
			return;
		};
		if let Some(response) = request.response() {
			response.resolve_body(None);
		}
		self.forget_request(&event.request_id);
		self.events.emit(NetworkEvent::RequestFinished(request));
	}

	fn on_loading_failed(self: &Arc<Self>, event: LoadingFailedEvent) {
		let mut state = self.state.lock();
		if let Some(group) = state.queued_event_group_mut(&event.request_id) {
			group.loading_failed = Some(event);
			return;
		}
		drop(state);
		self.emit_loading_failed(event);
	}

	fn emit_loading_failed(self: &Arc<Self>, event: LoadingFailedEvent) {
		let request = self.state.lock().request(&event.request_id);
		let Some(request) = request else {
			return;
		};
		request.set_failure(&event.error_text);
		if let Some(response) = request.response() {
			response.resolve_body(None);
		}
		self.forget_request(&event.request_id);
		self.events.emit(NetworkEvent::RequestFailed(request));
	}

	fn on_request_served_from_cache(self: &Arc<Self>, event: &RequestServedFromCacheEvent) {
		let request = self.state.lock().request(&event.request_id);
		let Some(request) = request else {
			return;
		};
		request.mark_from_memory_cache();
		self.events.emit(NetworkEvent::RequestServedFromCache(request));
	}

	fn forget_request(&self, network_id: &str) {
		let mut state = self.state.lock();
		state.forget_request(network_id);
		state.forget(network_id);
	}
}

impl Drop for NetworkManager {
	fn drop(&mut self) {
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
	}
}
