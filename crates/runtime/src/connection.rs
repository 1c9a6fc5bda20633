//! The root protocol connection.
//!
//! One [`Connection`] owns the transport, assigns request IDs, and
//! demultiplexes inbound frames: responses back to their callers,
//! session-scoped frames to the matching [`CdpSession`], and the rest
//! onto the connection's own event stream. `Target.attachedToTarget`
//! and `Target.detachedFromTarget` are intercepted here so the session
//! table is always consistent before anyone observes the event.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use cdp_protocol::target::{AttachedToTargetEvent, DetachedFromTargetEvent};
use cdp_protocol::{Command, Event, Message, Response};

use crate::callback_registry::CallbackRegistry;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::session::CdpSession;
use crate::transport::{TransportParts, WebSocketTransport};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(180);

/// A protocol event with its payload, cheap to clone across the bus.
#[derive(Debug, Clone)]
pub struct ProtocolEvent {
	pub method: Arc<str>,
	pub params: Arc<Value>,
}

/// Events observable on the connection.
#[derive(Clone)]
pub enum ConnectionEvent {
	/// A session attached (auto-attach or explicit).
	SessionAttached(Arc<CdpSession>),
	/// A session detached; it is already marked closed.
	SessionDetached(Arc<CdpSession>),
	/// A browser-level protocol event (no `sessionId`).
	Event(ProtocolEvent),
	/// The transport closed; no further frames will arrive.
	Disconnected,
}

/// Connection to a browser over a protocol transport.
pub struct Connection {
	last_id: AtomicU64,
	callbacks: CallbackRegistry,
	outbound_tx: mpsc::UnboundedSender<String>,
	sessions: DashMap<Arc<str>, Arc<CdpSession>>,
	manually_attached: Mutex<HashSet<String>>,
	events: EventBus<ConnectionEvent>,
	closed: AtomicBool,
	command_timeout: Duration,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
	/// Connects to a WebSocket debugging endpoint.
	pub async fn connect(url: &str) -> Result<Arc<Self>> {
		let parts = WebSocketTransport::connect(url).await?;
		Ok(Self::with_transport(parts))
	}

	/// Wraps an already-established transport.
	pub fn with_transport(parts: TransportParts) -> Arc<Self> {
		Self::with_transport_and_timeout(parts, DEFAULT_COMMAND_TIMEOUT)
	}

	pub fn with_transport_and_timeout(parts: TransportParts, timeout: Duration) -> Arc<Self> {
		let TransportParts {
			mut sender,
			mut incoming,
		} = parts;
		let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

		let connection = Arc::new(Self {
			last_id: AtomicU64::new(0),
			callbacks: CallbackRegistry::new(),
			outbound_tx,
			sessions: DashMap::new(),
			manually_attached: Mutex::new(HashSet::new()),
			events: EventBus::new(1024),
			closed: AtomicBool::new(false),
			command_timeout: timeout,
			tasks: Mutex::new(Vec::new()),
		});

		let writer = tokio::spawn(async move {
			while let Some(frame) = outbound_rx.recv().await {
				if let Err(e) = sender.send(frame).await {
					tracing::error!("transport write failed: {e}");
					break;
				}
			}
		});

		let weak = Arc::downgrade(&connection);
		let reader = tokio::spawn(async move {
			while let Some(frame) = incoming.recv().await {
				let Some(connection) = weak.upgrade() else {
					break;
				};
				connection.dispatch(&frame);
			}
			if let Some(connection) = weak.upgrade() {
				connection.on_close();
			}
		});

		connection.tasks.lock().extend([writer, reader]);
		connection
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Sends a browser-level command and awaits its response.
	pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
		self.send_scoped(None, &self.callbacks, method, params).await
	}

	pub(crate) async fn send_scoped(
		&self,
		session_id: Option<&Arc<str>>,
		registry: &CallbackRegistry,
		method: &str,
		params: Value,
	) -> Result<Value> {
		if self.is_closed() {
			return Err(Error::ConnectionClosed(format!(
				"cannot send {method}, the connection is closed"
			)));
		}
		let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
		let future = registry.create(id, method);

		let command = Command {
			id,
			method: method.to_string(),
			params,
			session_id: session_id.map(|s| s.to_string()),
		};
		let frame = serde_json::to_string(&command)?;
		tracing::trace!(%method, id, "send");
		if self.outbound_tx.send(frame).is_err() {
			registry.reject(id, Error::ChannelClosed);
		}

		match tokio::time::timeout(self.command_timeout, future).await {
			Ok(result) => result,
			Err(_) => Err(Error::Timeout(format!(
				"{method} did not complete within {} ms",
				self.command_timeout.as_millis()
			))),
		}
	}

	/// Attaches to `target_id` explicitly, returning the new session.
	///
	/// The attach is recorded so target-lifecycle code can tell it
	/// apart from auto-attached sessions.
	pub async fn create_session(self: &Arc<Self>, target_id: &str) -> Result<Arc<CdpSession>> {
		let params = serde_json::to_value(&cdp_protocol::target::AttachToTargetParams {
			target_id: target_id.to_string(),
			flatten: true,
		})?;
		self.manually_attached.lock().insert(target_id.to_string());
		let result = self.send("Target.attachToTarget", params).await;
		self.manually_attached.lock().remove(target_id);
		let result = result?;

		let response: cdp_protocol::target::AttachToTargetResponse =
			serde_json::from_value(result)?;
		// Inbound frames are dispatched in order, so the attached event
		// preceded this response and the session already exists.
		self.session(&response.session_id).ok_or_else(|| {
			Error::ConnectionClosed(format!(
				"session {} vanished before attach completed",
				response.session_id
			))
		})
	}

	/// Whether `target_id` was attached automatically rather than via
	/// [`Connection::create_session`].
	pub fn is_auto_attached(&self, target_id: &str) -> bool {
		!self.manually_attached.lock().contains(target_id)
	}

	/// Looks up a live session by ID.
	pub fn session(&self, session_id: &str) -> Option<Arc<CdpSession>> {
		self.sessions.get(session_id).map(|s| Arc::clone(&s))
	}

	/// Snapshot of all live sessions.
	pub fn sessions(&self) -> Vec<Arc<CdpSession>> {
		self.sessions.iter().map(|s| Arc::clone(&s)).collect()
	}

	/// Subscribes to connection-level events.
	pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
		self.events.subscribe()
	}

	/// Waits for the first connection event matching `predicate`.
	pub async fn wait_for_event(
		&self,
		timeout: Duration,
		predicate: impl Fn(&ConnectionEvent) -> bool + Send + Sync + 'static,
	) -> Result<ConnectionEvent> {
		self.events.wait_for(timeout, predicate).await
	}

	/// Tears the connection down: fails every in-flight command, closes
	/// every session and stops the I/O tasks. Idempotent.
	pub fn dispose(&self) {
		self.on_close();
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
	}

	fn on_close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.callbacks
			.clear(|method| Error::ConnectionClosed(format!("{method} interrupted by disconnect")));
		let sessions: Vec<Arc<CdpSession>> = self.sessions();
		self.sessions.clear();
		for session in sessions {
			session.on_closed();
		}
		self.events.emit(ConnectionEvent::Disconnected);
	}

	fn dispatch(self: &Arc<Self>, frame: &str) {
		tracing::trace!(%frame, "recv");
		let message: Message = match serde_json::from_str(frame) {
			Ok(message) => message,
			Err(e) => {
				tracing::error!("dropping unparseable frame: {e}");
				return;
			}
		};
		match message {
			Message::Response(response) => self.dispatch_response(response),
			Message::Event(event) => self.dispatch_event(event),
			Message::Unknown(value) => {
				tracing::warn!(?value, "dropping frame of unknown shape");
			}
		}
	}

	fn dispatch_response(&self, response: Response) {
		let result = match (response.result, response.error) {
			(_, Some(error)) => {
				// The registry formats the rejection with the method name.
				let registry = match &response.session_id {
					Some(session_id) => match self.sessions.get(session_id.as_ref()) {
						Some(session) => {
							session.handle_error_response(response.id, &error);
							return;
						}
						None => &self.callbacks,
					},
					None => &self.callbacks,
				};
				registry.reject_payload(response.id, &error);
				return;
			}
			(result, None) => result.unwrap_or(Value::Null),
		};
		match &response.session_id {
			Some(session_id) => {
				if let Some(session) = self.sessions.get(session_id.as_ref()) {
					session.handle_response(response.id, Ok(result));
				} else {
					tracing::debug!(%session_id, id = response.id, "response for unknown session");
				}
			}
			None => {
				if !self.callbacks.resolve(response.id, result) {
					tracing::debug!(id = response.id, "response for unknown callback");
				}
			}
		}
	}

	fn dispatch_event(self: &Arc<Self>, event: Event) {
		// Session bookkeeping first, so the session table is settled
		// before the event becomes observable.
		match event.method.as_ref() {
			"Target.attachedToTarget" => {
				if let Ok(attached) =
					serde_json::from_value::<AttachedToTargetEvent>(event.params.clone())
				{
					self.handle_attached(attached, event.session_id.clone());
				}
			}
			"Target.detachedFromTarget" => {
				if let Ok(detached) =
					serde_json::from_value::<DetachedFromTargetEvent>(event.params.clone())
				{
					self.handle_detached(&detached);
				}
			}
			_ => {}
		}

		let protocol_event = ProtocolEvent {
			method: event.method,
			params: Arc::new(event.params),
		};
		match &event.session_id {
			Some(session_id) => {
				if let Some(session) = self.sessions.get(session_id.as_ref()) {
					session.handle_event(protocol_event);
				}
			}
			None => self.events.emit(ConnectionEvent::Event(protocol_event)),
		}
	}

	fn handle_attached(
		self: &Arc<Self>,
		attached: AttachedToTargetEvent,
		parent_session_id: Option<Arc<str>>,
	) {
		let id: Arc<str> = Arc::from(attached.session_id.as_str());
		let session = CdpSession::new(
			self,
			Arc::clone(&id),
			attached.target_info.kind.clone(),
			parent_session_id,
		);
		self.sessions.insert(id, Arc::clone(&session));
		self.events.emit(ConnectionEvent::SessionAttached(session));
	}

	fn handle_detached(&self, detached: &DetachedFromTargetEvent) {
		if let Some((_, session)) = self.sessions.remove(detached.session_id.as_str()) {
			session.on_closed();
			self.events.emit(ConnectionEvent::SessionDetached(session));
		}
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
	}
}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Connection")
			.field("closed", &self.is_closed())
			.field("sessions", &self.sessions.len())
			.field("pending", &self.callbacks.pending_count())
			.finish()
	}
}
