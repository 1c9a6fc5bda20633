//! Maintains a page's frame tree and routes execution contexts.
//!
//! All `Page.*` frame lifecycle events and `Runtime.executionContext*`
//! events for one session funnel through here. The manager keeps the
//! [`Frame`] tree current, installs contexts into the right world, and
//! re-emits digested events for navigation watchers.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use cdp_protocol::page::{
	CreateIsolatedWorldParams, FrameAttachedEvent, FrameDetachedEvent, FrameNavigatedEvent,
	FramePayload, FrameStartedLoadingEvent, FrameStoppedLoadingEvent, FrameTree,
	GetFrameTreeResponse, LifecycleEventEvent, NavigateParams, NavigateResponse,
	NavigatedWithinDocumentEvent,
};
use cdp_protocol::runtime::{
	ExecutionContextCreatedEvent, ExecutionContextDescription, ExecutionContextDestroyedEvent,
};
use cdp_runtime::events::EventBus;
use cdp_runtime::{CdpSession, Error, ProtocolEvent, Result, SessionEvent};

use crate::execution_context::ExecutionContext;
use crate::frame::Frame;
use crate::isolated_world::{IsolatedWorld, UTILITY_WORLD_NAME};

/// Digested frame-tree changes, consumed by navigation watchers.
#[derive(Clone)]
pub enum FrameEvent {
	Attached(Arc<Frame>),
	/// A new document committed in the frame.
	Navigated {
		frame: Arc<Frame>,
		navigation_type: Option<String>,
	},
	/// Same-document URL change (pushState, fragment).
	NavigatedWithinDocument(Arc<Frame>),
	Detached(Arc<Frame>),
	/// The frame's document moved to a different session.
	Swapped(Arc<Frame>),
	/// The frame reached a lifecycle milestone.
	LifecycleEvent(Arc<Frame>),
}

pub struct FrameManager {
	session: Mutex<Arc<CdpSession>>,
	frames: Mutex<HashMap<String, Arc<Frame>>>,
	main_frame_id: Mutex<Option<String>>,
	/// Execution-context id to the world it was installed into.
	contexts: Mutex<HashMap<i64, Arc<IsolatedWorld>>>,
	/// `"sessionId:frameId"` pairs a utility world was requested for.
	isolated_worlds: Mutex<HashSet<String>>,
	events: EventBus<FrameEvent>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FrameManager {
	pub fn new(session: Arc<CdpSession>) -> Arc<Self> {
		Arc::new(Self {
			session: Mutex::new(session),
			frames: Mutex::new(HashMap::new()),
			main_frame_id: Mutex::new(None),
			contexts: Mutex::new(HashMap::new()),
			isolated_worlds: Mutex::new(HashSet::new()),
			events: EventBus::new(1024),
			tasks: Mutex::new(Vec::new()),
		})
	}

	/// Enables the Page and Runtime domains, seeds the frame tree and
	/// starts routing session events.
	pub async fn initialize(self: &Arc<Self>) -> Result<()> {
		self.spawn_event_loop();

		let session = self.session();
		session.send("Page.enable", serde_json::json!({})).await?;
		let tree = session
			.send("Page.getFrameTree", serde_json::json!({}))
			.await?;
		let tree: GetFrameTreeResponse = serde_json::from_value(tree)?;
		self.handle_frame_tree(&tree.frame_tree, None);

		session
			.send(
				"Page.setLifecycleEventsEnabled",
				serde_json::json!({"enabled": true}),
			)
			.await?;
		session.send("Runtime.enable", serde_json::json!({})).await?;

		// Future documents get the utility world from this injection;
		// already-live frames need an explicit create below.
		session
			.send(
				"Page.addScriptToEvaluateOnNewDocument",
				serde_json::json!({
					"source": format!("//# sourceURL={UTILITY_WORLD_NAME}"),
					"worldName": UTILITY_WORLD_NAME,
				}),
			)
			.await?;
		for frame in self.frames() {
			self.ensure_isolated_world(frame.id()).await;
		}
		Ok(())
	}

	pub fn session(&self) -> Arc<CdpSession> {
		Arc::clone(&self.session.lock())
	}

	pub fn frame(&self, id: &str) -> Option<Arc<Frame>> {
		self.frames.lock().get(id).cloned()
	}

	pub fn frames(&self) -> Vec<Arc<Frame>> {
		self.frames.lock().values().cloned().collect()
	}

	pub fn main_frame(&self) -> Option<Arc<Frame>> {
		let id = self.main_frame_id.lock().clone()?;
		self.frame(&id)
	}

	pub fn subscribe(&self) -> broadcast::Receiver<FrameEvent> {
		self.events.subscribe()
	}

	pub(crate) fn bus(&self) -> &EventBus<FrameEvent> {
		&self.events
	}

	/// Starts a navigation in `frame`; resolves with the new loader ID
	/// once the browser accepts it (None for same-document).
	pub(crate) async fn navigate_frame(
		&self,
		frame: &Arc<Frame>,
		url: &str,
		referrer: Option<String>,
	) -> Result<Option<String>> {
		let params = NavigateParams {
			url: url.to_string(),
			referrer,
			frame_id: Some(frame.id().to_string()),
		};
		let result = frame
			.session()
			.send("Page.navigate", serde_json::to_value(&params)?)
			.await?;
		let response: NavigateResponse = serde_json::from_value(result)?;
		if let Some(error_text) = response.error_text {
			return Err(Error::Protocol {
				method: "Page.navigate".to_string(),
				message: format!("{error_text} at {url}"),
			});
		}
		Ok(response.loader_id)
	}

	pub(crate) fn dispose(&self) {
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
	}

	/// Tracks a spawned task for teardown, dropping handles of tasks
	/// that already ran to completion.
	fn track(&self, task: JoinHandle<()>) {
		let mut tasks = self.tasks.lock();
		tasks.retain(|earlier| !earlier.is_finished());
		tasks.push(task);
	}

	fn spawn_event_loop(self: &Arc<Self>) {
		let weak = Arc::downgrade(self);
		let mut events = self.session().subscribe();
		let task = tokio::spawn(async move {
			loop {
				let event = match events.recv().await {
					Ok(SessionEvent::Event(event)) => event,
					Ok(SessionEvent::Disconnected) => break,
					Err(broadcast::error::RecvError::Lagged(n)) => {
						tracing::warn!(skipped = n, "frame event stream lagged");
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
		self.track(task);
	}

	fn handle_session_event(self: &Arc<Self>, event: &ProtocolEvent) {
		let params = event.params.as_ref();
		match event.method.as_ref() {
			"Page.frameAttached" => {
				if let Ok(e) = serde_json::from_value::<FrameAttachedEvent>(params.clone()) {
					self.on_frame_attached(&e.frame_id, Some(&e.parent_frame_id));
				}
			}
			"Page.frameNavigated" => {
				if let Ok(e) = serde_json::from_value::<FrameNavigatedEvent>(params.clone()) {
					self.on_frame_navigated(&e.frame, e.navigation_type);
				}
			}
			"Page.frameDetached" => {
				if let Ok(e) = serde_json::from_value::<FrameDetachedEvent>(params.clone()) {
					self.on_frame_detached(&e.frame_id, e.reason.as_deref());
				}
			}
			"Page.frameStartedLoading" => {
				if let Ok(e) = serde_json::from_value::<FrameStartedLoadingEvent>(params.clone()) {
					if let Some(frame) = self.frame(&e.frame_id) {
						frame.on_loading_started();
					}
				}
			}
			"Page.frameStoppedLoading" => {
				if let Ok(e) = serde_json::from_value::<FrameStoppedLoadingEvent>(params.clone()) {
					if let Some(frame) = self.frame(&e.frame_id) {
						frame.on_loading_stopped();
						self.events.emit(FrameEvent::LifecycleEvent(frame));
					}
				}
			}
			"Page.lifecycleEvent" => {
				if let Ok(e) = serde_json::from_value::<LifecycleEventEvent>(params.clone()) {
					if let Some(frame) = self.frame(&e.frame_id) {
						frame.on_lifecycle_event(&e.loader_id, &e.name);
						self.events.emit(FrameEvent::LifecycleEvent(frame));
					}
				}
			}
			"Page.navigatedWithinDocument" => {
				if let Ok(e) = serde_json::from_value::<NavigatedWithinDocumentEvent>(params.clone())
				{
					if let Some(frame) = self.frame(&e.frame_id) {
						frame.on_navigated_within_document(&e.url);
						self.events
							.emit(FrameEvent::NavigatedWithinDocument(frame));
					}
				}
			}
			"Runtime.executionContextCreated" => {
				if let Ok(e) = serde_json::from_value::<ExecutionContextCreatedEvent>(params.clone())
				{
					self.on_context_created(&e.context);
				}
			}
			"Runtime.executionContextDestroyed" => {
				if let Ok(e) =
					serde_json::from_value::<ExecutionContextDestroyedEvent>(params.clone())
				{
					self.on_context_destroyed(e.execution_context_id);
				}
			}
			"Runtime.executionContextsCleared" => self.on_contexts_cleared(),
			_ => {}
		}
	}

	fn handle_frame_tree(self: &Arc<Self>, tree: &FrameTree, parent_id: Option<&str>) {
		self.on_frame_attached(&tree.frame.id, parent_id);
		self.on_frame_navigated(&tree.frame, None);
		for child in tree.child_frames.as_deref().unwrap_or_default() {
			self.handle_frame_tree(child, Some(&tree.frame.id));
		}
	}

	fn on_frame_attached(self: &Arc<Self>, frame_id: &str, parent_id: Option<&str>) {
		if self.frames.lock().contains_key(frame_id) {
			return;
		}
		let frame = Frame::new(
			frame_id.to_string(),
			parent_id.map(str::to_string),
			self.session(),
		);
		if let Some(parent) = parent_id.and_then(|id| self.frame(id)) {
			parent.add_child(frame_id);
		}
		if parent_id.is_none() {
			*self.main_frame_id.lock() = Some(frame_id.to_string());
		}
		self.frames
			.lock()
			.insert(frame_id.to_string(), Arc::clone(&frame));
		self.events.emit(FrameEvent::Attached(Arc::clone(&frame)));

		let manager = Arc::clone(self);
		let frame_id = frame_id.to_string();
		let task = tokio::spawn(async move {
			manager.ensure_isolated_world(&frame_id).await;
		});
		self.track(task);
	}

	fn on_frame_navigated(self: &Arc<Self>, payload: &FramePayload, navigation_type: Option<String>) {
		let frame = match self.frame(&payload.id) {
			Some(frame) => frame,
			None => {
				// A main-frame navigation can commit under a fresh
				// frame ID (cross-process). Adopt it as the new root.
				self.on_frame_attached(&payload.id, payload.parent_id.as_deref());
				match self.frame(&payload.id) {
					Some(frame) => frame,
					None => return,
				}
			}
		};
		if payload.parent_id.is_none() {
			*self.main_frame_id.lock() = Some(payload.id.clone());
		}
		frame.on_navigated(payload);
		self.events.emit(FrameEvent::Navigated {
			frame,
			navigation_type,
		});
	}

	fn on_frame_detached(&self, frame_id: &str, reason: Option<&str>) {
		let Some(frame) = self.frame(frame_id) else {
			return;
		};
		if reason == Some("swap") {
			self.events.emit(FrameEvent::Swapped(frame));
			return;
		}
		self.remove_frames_recursively(&frame);
	}

	fn remove_frames_recursively(&self, frame: &Arc<Frame>) {
		for child_id in frame.child_ids() {
			if let Some(child) = self.frame(&child_id) {
				self.remove_frames_recursively(&child);
			}
		}
		frame.on_detached();
		self.frames.lock().remove(frame.id());
		if let Some(parent) = frame.parent_id().and_then(|id| self.frame(id)) {
			parent.remove_child(frame.id());
		}
		self.events.emit(FrameEvent::Detached(Arc::clone(frame)));
	}

	fn on_context_created(&self, description: &ExecutionContextDescription) {
		let aux = description.aux_data.as_ref();
		let frame_id = aux
			.and_then(|aux| aux.get("frameId"))
			.and_then(Value::as_str);
		let Some(frame) = frame_id.and_then(|id| self.frame(id)) else {
			return;
		};
		let is_default = aux
			.and_then(|aux| aux.get("isDefault"))
			.and_then(Value::as_bool)
			.unwrap_or(false);

		let world = if is_default {
			Arc::clone(frame.main_world())
		} else if description.name == UTILITY_WORLD_NAME {
			Arc::clone(frame.utility_world())
		} else {
			return;
		};
		world.set_context(ExecutionContext::new(description.id, frame.session()));
		self.contexts.lock().insert(description.id, world);
	}

	fn on_context_destroyed(&self, context_id: i64) {
		if let Some(world) = self.contexts.lock().remove(&context_id) {
			world.clear_context();
		}
	}

	fn on_contexts_cleared(&self) {
		let worlds: Vec<Arc<IsolatedWorld>> = self.contexts.lock().drain().map(|(_, w)| w).collect();
		for world in worlds {
			world.clear_context();
		}
	}

	/// Requests the utility world for a frame, at most once per
	/// session and frame.
	async fn ensure_isolated_world(&self, frame_id: &str) {
		let session = self.session();
		let key = format!("{}:{frame_id}", session.id());
		if !self.isolated_worlds.lock().insert(key) {
			return;
		}
		let params = CreateIsolatedWorldParams {
			frame_id: frame_id.to_string(),
			world_name: UTILITY_WORLD_NAME.to_string(),
			grant_univeral_access: true,
		};
		let params = match serde_json::to_value(&params) {
			Ok(params) => params,
			Err(_) => return,
		};
		// The resulting context arrives as executionContextCreated.
		if let Err(e) = session.send("Page.createIsolatedWorld", params).await {
			tracing::debug!(frame_id, "createIsolatedWorld failed: {e}");
		}
	}
}
