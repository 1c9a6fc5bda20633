//! Flattened protocol sessions.
//!
//! A [`CdpSession`] scopes commands and events to one attached target.
//! The owning [`Connection`] routes every frame carrying a `sessionId`
//! to the matching session; the session keeps its own callback registry
//! so a detach can fail exactly the commands that were in flight on it.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::callback_registry::CallbackRegistry;
use crate::connection::{Connection, ProtocolEvent};
use crate::error::{Error, Result};
use crate::events::EventBus;

/// Events observable on a session.
#[derive(Clone)]
pub enum SessionEvent {
	/// A protocol event scoped to this session.
	Event(ProtocolEvent),
	/// The session was detached from its target.
	Disconnected,
}

/// A protocol session attached to a single target.
pub struct CdpSession {
	id: Arc<str>,
	target_kind: String,
	parent_session_id: Option<Arc<str>>,
	connection: Weak<Connection>,
	callbacks: CallbackRegistry,
	events: EventBus<SessionEvent>,
	detached: AtomicBool,
}

impl CdpSession {
	pub(crate) fn new(
		connection: &Arc<Connection>,
		id: Arc<str>,
		target_kind: String,
		parent_session_id: Option<Arc<str>>,
	) -> Arc<Self> {
		Arc::new(Self {
			id,
			target_kind,
			parent_session_id,
			connection: Arc::downgrade(connection),
			callbacks: CallbackRegistry::new(),
			events: EventBus::new(256),
			detached: AtomicBool::new(false),
		})
	}

	/// The protocol session ID, as assigned by the browser.
	pub fn id(&self) -> &Arc<str> {
		&self.id
	}

	/// Type of the target this session is attached to ("page",
	/// "service_worker", ...).
	pub fn target_kind(&self) -> &str {
		&self.target_kind
	}

	/// ID of the parent session for auto-attached child targets.
	pub fn parent_session_id(&self) -> Option<&Arc<str>> {
		self.parent_session_id.as_ref()
	}

	/// The owning connection, if it is still alive.
	pub fn connection(&self) -> Option<Arc<Connection>> {
		self.connection.upgrade()
	}

	pub fn is_detached(&self) -> bool {
		self.detached.load(Ordering::SeqCst)
	}

	/// Sends a command scoped to this session and awaits its response.
	pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
		if self.is_detached() {
			return Err(self.closed_error(method));
		}
		let connection = self
			.connection
			.upgrade()
			.ok_or_else(|| self.closed_error(method))?;
		connection
			.send_scoped(Some(&self.id), &self.callbacks, method, params)
			.await
	}

	/// Detaches this session from its target.
	pub async fn detach(&self) -> Result<()> {
		let connection = self
			.connection
			.upgrade()
			.ok_or_else(|| self.closed_error("Target.detachFromTarget"))?;
		connection
			.send(
				"Target.detachFromTarget",
				serde_json::json!({ "sessionId": self.id.as_ref() }),
			)
			.await?;
		Ok(())
	}

	/// Subscribes to this session's event stream.
	pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
		self.events.subscribe()
	}

	/// Waits for the first session event matching `predicate`.
	pub async fn wait_for_event(
		&self,
		timeout: Duration,
		predicate: impl Fn(&SessionEvent) -> bool + Send + Sync + 'static,
	) -> Result<SessionEvent> {
		self.events.wait_for(timeout, predicate).await
	}

	/// Emits a session-level event. Used by higher layers to signal
	/// swaps and child-session readiness.
	pub fn emit(&self, event: SessionEvent) {
		self.events.emit(event);
	}

	pub(crate) fn handle_response(&self, id: u64, result: Result<Value>) {
		let resolved = match result {
			Ok(value) => self.callbacks.resolve(id, value),
			Err(error) => self.callbacks.reject(id, error),
		};
		if !resolved {
			tracing::debug!(session = %self.id, id, "response for unknown callback");
		}
	}

	pub(crate) fn handle_error_response(&self, id: u64, error: &cdp_protocol::ErrorPayload) {
		if !self.callbacks.reject_payload(id, error) {
			tracing::debug!(session = %self.id, id, "error response for unknown callback");
		}
	}

	pub(crate) fn handle_event(&self, event: ProtocolEvent) {
		self.events.emit(SessionEvent::Event(event));
	}

	/// Marks the session detached, failing every in-flight command and
	/// notifying subscribers. Safe to call more than once.
	pub(crate) fn on_closed(&self) {
		if self.detached.swap(true, Ordering::SeqCst) {
			return;
		}
		let target_kind = self.target_kind.clone();
		self.callbacks.clear(move |method| Error::TargetClosed {
			target_type: target_kind.clone(),
			context: format!("session closed while sending {method}"),
		});
		self.events.emit(SessionEvent::Disconnected);
	}

	fn closed_error(&self, method: &str) -> Error {
		Error::TargetClosed {
			target_type: self.target_kind.clone(),
			context: format!(
				"session closed before {method} could be sent, most likely the {} has been closed",
				self.target_kind
			),
		}
	}
}

impl std::fmt::Debug for CdpSession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CdpSession")
			.field("id", &self.id)
			.field("target_kind", &self.target_kind)
			.field("detached", &self.is_detached())
			.finish()
	}
}
