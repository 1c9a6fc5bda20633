//! A document frame and its lifecycle bookkeeping.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cdp_protocol::page::FramePayload;
use cdp_runtime::{CdpSession, Error, Result};

use crate::execution_context::RemoteHandle;
use crate::isolated_world::{IsolatedWorld, WorldKind};

/// One frame in a page's frame tree.
///
/// Lifecycle state is driven entirely by `Page.*` events routed in by
/// the frame manager: `lifecycle_events` holds the milestone names the
/// current document has reached and is reset whenever a new loader
/// commits.
pub struct Frame {
	id: String,
	parent_id: Option<String>,
	session: Mutex<Arc<CdpSession>>,
	loader_id: Mutex<String>,
	url: Mutex<String>,
	name: Mutex<Option<String>>,
	detached: AtomicBool,
	has_started_loading: AtomicBool,
	lifecycle_events: Mutex<HashSet<String>>,
	child_ids: Mutex<HashSet<String>>,
	main_world: Arc<IsolatedWorld>,
	utility_world: Arc<IsolatedWorld>,
}

impl Frame {
	pub(crate) fn new(id: String, parent_id: Option<String>, session: Arc<CdpSession>) -> Arc<Self> {
		Arc::new(Self {
			id,
			parent_id,
			session: Mutex::new(session),
			loader_id: Mutex::new(String::new()),
			url: Mutex::new(String::new()),
			name: Mutex::new(None),
			detached: AtomicBool::new(false),
			has_started_loading: AtomicBool::new(false),
			lifecycle_events: Mutex::new(HashSet::new()),
			child_ids: Mutex::new(HashSet::new()),
			main_world: IsolatedWorld::new(WorldKind::Main),
			utility_world: IsolatedWorld::new(WorldKind::Utility),
		})
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn parent_id(&self) -> Option<&str> {
		self.parent_id.as_deref()
	}

	pub fn url(&self) -> String {
		self.url.lock().clone()
	}

	pub fn name(&self) -> Option<String> {
		self.name.lock().clone()
	}

	pub fn loader_id(&self) -> String {
		self.loader_id.lock().clone()
	}

	pub fn is_detached(&self) -> bool {
		self.detached.load(Ordering::SeqCst)
	}

	pub fn has_started_loading(&self) -> bool {
		self.has_started_loading.load(Ordering::SeqCst)
	}

	pub fn session(&self) -> Arc<CdpSession> {
		Arc::clone(&self.session.lock())
	}

	pub fn main_world(&self) -> &Arc<IsolatedWorld> {
		&self.main_world
	}

	pub fn utility_world(&self) -> &Arc<IsolatedWorld> {
		&self.utility_world
	}

	/// Whether the current document has reached the given lifecycle
	/// milestone ("load", "DOMContentLoaded", "networkIdle", ...).
	pub fn has_lifecycle_event(&self, name: &str) -> bool {
		self.lifecycle_events.lock().contains(name)
	}

	pub fn child_ids(&self) -> Vec<String> {
		self.child_ids.lock().iter().cloned().collect()
	}

	pub async fn evaluate(&self, expression: &str) -> Result<Value> {
		self.main_world.evaluate(expression).await
	}

	pub async fn call_function(&self, declaration: &str, args: Vec<Value>) -> Result<Value> {
		self.main_world.call_function(declaration, args).await
	}

	pub async fn evaluate_handle(&self, expression: &str) -> Result<RemoteHandle> {
		self.main_world.evaluate_handle(expression).await
	}

	pub(crate) fn add_child(&self, child_id: &str) {
		self.child_ids.lock().insert(child_id.to_string());
	}

	pub(crate) fn remove_child(&self, child_id: &str) {
		self.child_ids.lock().remove(child_id);
	}

	/// `Page.lifecycleEvent`: the "init" milestone marks a new loader
	/// and resets the milestones of the previous document.
	pub(crate) fn on_lifecycle_event(&self, loader_id: &str, name: &str) {
		if name == "init" {
			*self.loader_id.lock() = loader_id.to_string();
			self.lifecycle_events.lock().clear();
		}
		self.lifecycle_events.lock().insert(name.to_string());
	}

	pub(crate) fn on_loading_started(&self) {
		self.has_started_loading.store(true, Ordering::SeqCst);
	}

	/// `Page.frameStoppedLoading` implies both document milestones.
	pub(crate) fn on_loading_stopped(&self) {
		let mut events = self.lifecycle_events.lock();
		events.insert("DOMContentLoaded".to_string());
		events.insert("load".to_string());
	}

	/// `Page.frameNavigated`: a new document committed.
	pub(crate) fn on_navigated(&self, payload: &FramePayload) {
		*self.loader_id.lock() = payload.loader_id.clone();
		*self.name.lock() = payload.name.clone();
		let mut url = payload.url.clone();
		if let Some(fragment) = &payload.url_fragment {
			url.push_str(fragment);
		}
		*self.url.lock() = url;
	}

	/// `Page.navigatedWithinDocument`: same document, new URL.
	pub(crate) fn on_navigated_within_document(&self, url: &str) {
		*self.url.lock() = url.to_string();
	}

	pub(crate) fn on_detached(&self) {
		self.detached.store(true, Ordering::SeqCst);
		let reason = Error::Evaluation("waitForFunction failed: frame got detached".to_string());
		self.main_world.dispose(reason.clone());
		self.utility_world.dispose(reason);
	}
}

impl std::fmt::Debug for Frame {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Frame")
			.field("id", &self.id)
			.field("url", &self.url())
			.field("detached", &self.is_detached())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_util::attached_session;

	#[tokio::test]
	async fn init_lifecycle_resets_previous_document_milestones() {
		let (_connection, session, _handle) = attached_session().await;
		let frame = Frame::new("F1".into(), None, session);

		frame.on_lifecycle_event("L1", "init");
		frame.on_lifecycle_event("L1", "DOMContentLoaded");
		frame.on_lifecycle_event("L1", "load");
		assert!(frame.has_lifecycle_event("load"));

		frame.on_lifecycle_event("L2", "init");
		assert!(!frame.has_lifecycle_event("load"));
		assert!(!frame.has_lifecycle_event("DOMContentLoaded"));
		assert_eq!(frame.loader_id(), "L2");
		assert!(frame.has_lifecycle_event("init"));
	}

	#[tokio::test]
	async fn stopped_loading_marks_both_document_milestones() {
		let (_connection, session, _handle) = attached_session().await;
		let frame = Frame::new("F1".into(), None, session);

		frame.on_loading_stopped();
		assert!(frame.has_lifecycle_event("load"));
		assert!(frame.has_lifecycle_event("DOMContentLoaded"));
	}

	#[tokio::test]
	async fn detach_disposes_both_worlds() {
		let (_connection, session, _handle) = attached_session().await;
		let frame = Frame::new("F1".into(), None, session);

		frame.on_detached();
		assert!(frame.is_detached());
		assert!(frame.main_world().is_disposed());
		assert!(frame.utility_world().is_disposed());
	}
}
