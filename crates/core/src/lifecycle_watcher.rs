//! Navigation completion detection.
//!
//! A [`LifecycleWatcher`] observes one frame from the moment a
//! navigation is requested until the target lifecycle milestones hold
//! for the frame and every descendant that started loading. It
//! distinguishes new-document commits (loader ID change or frame swap)
//! from same-document updates, and terminates early when the frame
//! detaches.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use cdp_runtime::{Error, Result};

use crate::frame::Frame;
use crate::frame_manager::{FrameEvent, FrameManager};
use crate::network::{HttpResponse, NetworkEvent, NetworkManager};
use crate::util::Deferred;

/// Navigation completion condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
	/// The `load` event fired.
	Load,
	/// The `DOMContentLoaded` event fired.
	DomContentLoaded,
	/// No network connections for at least 500 ms.
	NetworkIdle0,
	/// At most two network connections for at least 500 ms.
	NetworkIdle2,
}

impl WaitUntil {
	/// The lifecycle milestone name the browser reports for this
	/// condition.
	pub fn lifecycle_event(self) -> &'static str {
		match self {
			WaitUntil::Load => "load",
			WaitUntil::DomContentLoaded => "DOMContentLoaded",
			WaitUntil::NetworkIdle0 => "networkIdle",
			WaitUntil::NetworkIdle2 => "networkAlmostIdle",
		}
	}
}

#[derive(Default)]
struct WatcherState {
	same_document: bool,
	swapped: bool,
}

pub struct LifecycleWatcher {
	frame_manager: Arc<FrameManager>,
	frame: Arc<Frame>,
	expected: Vec<&'static str>,
	initial_loader_id: String,
	state: Mutex<WatcherState>,
	/// Resolved once a navigation committed and every expected
	/// milestone holds.
	done: Deferred<()>,
	/// Rejected on detach or disposal.
	termination: Deferred<()>,
	navigation_request_id: Mutex<Option<String>>,
	navigation_response: Mutex<Option<Arc<HttpResponse>>>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LifecycleWatcher {
	pub fn new(
		frame_manager: &Arc<FrameManager>,
		frame: &Arc<Frame>,
		wait_until: &[WaitUntil],
		network: Option<&Arc<NetworkManager>>,
	) -> Arc<Self> {
		let watcher = Arc::new(Self {
			frame_manager: Arc::clone(frame_manager),
			frame: Arc::clone(frame),
			expected: wait_until.iter().map(|w| w.lifecycle_event()).collect(),
			initial_loader_id: frame.loader_id(),
			state: Mutex::new(WatcherState::default()),
			done: Deferred::new(),
			termination: Deferred::new(),
			navigation_request_id: Mutex::new(None),
			navigation_response: Mutex::new(None),
			tasks: Mutex::new(Vec::new()),
		});
		watcher.spawn_frame_listener();
		if let Some(network) = network {
			watcher.spawn_network_listener(network);
		}
		watcher
	}

	/// Waits for the navigation to complete, returning its main
	/// response when network tracking observed one.
	pub async fn wait(
		self: &Arc<Self>,
		url_hint: &str,
		timeout: Duration,
	) -> Result<Option<Arc<HttpResponse>>> {
		let outcome = tokio::select! {
			done = self.done.wait() => done,
			termination = self.termination.wait() => termination,
			() = tokio::time::sleep(timeout) => Err(Error::NavigationTimeout {
				url: url_hint.to_string(),
				duration_ms: timeout.as_millis() as u64,
			}),
		};
		outcome?;
		Ok(self.navigation_response.lock().clone())
	}

	pub fn dispose(&self) {
		self.termination
			.reject(Error::Aborted("navigation watcher disposed".to_string()));
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
	}

	fn spawn_frame_listener(self: &Arc<Self>) {
		let mut events = self.frame_manager.subscribe();
		let weak = Arc::downgrade(self);
		let task = tokio::spawn(async move {
			// The requested milestones may already hold.
			if let Some(watcher) = weak.upgrade() {
				watcher.check();
			}
			loop {
				let event = match events.recv().await {
					Ok(event) => event,
					Err(broadcast::error::RecvError::Lagged(_)) => {
						if let Some(watcher) = weak.upgrade() {
							watcher.check();
						}
						continue;
					}
					Err(broadcast::error::RecvError::Closed) => break,
				};
				let Some(watcher) = weak.upgrade() else {
					break;
				};
				watcher.on_frame_event(&event);
				if watcher.done.is_settled() || watcher.termination.is_settled() {
					break;
				}
			}
		});
		self.tasks.lock().push(task);
	}

	fn spawn_network_listener(self: &Arc<Self>, network: &Arc<NetworkManager>) {
		let mut events = network.subscribe();
		let weak = Arc::downgrade(self);
		let task = tokio::spawn(async move {
			loop {
				let event = match events.recv().await {
					Ok(event) => event,
					Err(broadcast::error::RecvError::Lagged(_)) => continue,
					Err(broadcast::error::RecvError::Closed) => break,
				};
				let Some(watcher) = weak.upgrade() else {
					break;
				};
				watcher.on_network_event(&event);
			}
		});
		self.tasks.lock().push(task);
	}

	fn on_frame_event(&self, event: &FrameEvent) {
		match event {
			FrameEvent::LifecycleEvent(_) | FrameEvent::Attached(_) => self.check(),
			FrameEvent::Navigated {
				frame,
				navigation_type,
			} => {
				if frame.id() == self.frame.id()
					&& navigation_type.as_deref() == Some("BackForwardCacheRestore")
				{
					self.state.lock().swapped = true;
				}
				self.check();
			}
			FrameEvent::NavigatedWithinDocument(frame) => {
				if frame.id() == self.frame.id() {
					self.state.lock().same_document = true;
				}
				self.check();
			}
			FrameEvent::Swapped(frame) => {
				if frame.id() == self.frame.id() {
					self.state.lock().swapped = true;
				}
				self.check();
			}
			FrameEvent::Detached(frame) => {
				if frame.id() == self.frame.id() {
					self.termination.reject(Error::Evaluation(
						"Navigating frame was detached".to_string(),
					));
				} else {
					// A gone child can be what unblocks completion.
					self.check();
				}
			}
		}
	}

	fn on_network_event(&self, event: &NetworkEvent) {
		match event {
			NetworkEvent::Request(request) => {
				if request.frame_id() == Some(self.frame.id()) && request.is_navigation_request() {
					// A newer navigation request supersedes the old one.
					*self.navigation_request_id.lock() = Some(request.id().to_string());
					*self.navigation_response.lock() = None;
				}
			}
			NetworkEvent::Response(response) => {
				let matches = self
					.navigation_request_id
					.lock()
					.as_deref()
					.is_some_and(|id| id == response.request_id());
				if matches {
					*self.navigation_response.lock() = Some(Arc::clone(response));
				}
			}
			_ => {}
		}
	}

	fn check(&self) {
		if self.done.is_settled() || self.termination.is_settled() {
			return;
		}
		let navigated = {
			let state = self.state.lock();
			state.same_document || state.swapped || self.frame.loader_id() != self.initial_loader_id
		};
		if navigated && self.complete_for(&self.frame) {
			self.done.resolve(());
		}
	}

	/// A frame completes when it holds every expected milestone and so
	/// does every child that actually started loading.
	fn complete_for(&self, frame: &Arc<Frame>) -> bool {
		for expected in &self.expected {
			if !frame.has_lifecycle_event(expected) {
				return false;
			}
		}
		for child_id in frame.child_ids() {
			let Some(child) = self.frame_manager.frame(&child_id) else {
				continue;
			};
			if child.has_started_loading() && !self.complete_for(&child) {
				return false;
			}
		}
		true
	}
}

impl Drop for LifecycleWatcher {
	fn drop(&mut self) {
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_util::{attached_session, auto_respond};

	struct Harness {
		manager: Arc<FrameManager>,
		incoming: tokio::sync::mpsc::UnboundedSender<String>,
		_connection: Arc<cdp_runtime::Connection>,
	}

	async fn page_manager() -> Harness {
		let (connection, session, handle) = attached_session().await;
		let incoming = handle.incoming.clone();
		auto_respond(handle, |method, _| match method {
			"Page.getFrameTree" => serde_json::json!({
				"frameTree": {
					"frame": {"id": "F1", "loaderId": "L1", "url": "https://example.com/"},
					"childFrames": [
						{"frame": {"id": "F2", "parentId": "F1", "loaderId": "L2", "url": "https://example.com/ad"}},
					],
				},
			}),
			_ => serde_json::json!({}),
		});
		let manager = FrameManager::new(session);
		manager.initialize().await.unwrap();
		Harness {
			manager,
			incoming,
			_connection: connection,
		}
	}

	fn lifecycle(incoming: &tokio::sync::mpsc::UnboundedSender<String>, frame: &str, loader: &str, name: &str) {
		incoming
			.send(
				serde_json::json!({
					"method": "Page.lifecycleEvent",
					"params": {"frameId": frame, "loaderId": loader, "name": name, "timestamp": 1.0},
					"sessionId": "S1",
				})
				.to_string(),
			)
			.unwrap();
	}

	fn navigated(incoming: &tokio::sync::mpsc::UnboundedSender<String>, frame: &str, loader: &str) {
		incoming
			.send(
				serde_json::json!({
					"method": "Page.frameNavigated",
					"params": {"frame": {"id": frame, "loaderId": loader, "url": "https://example.com/next"}, "type": "Navigation"},
					"sessionId": "S1",
				})
				.to_string(),
			)
			.unwrap();
	}

	#[tokio::test]
	async fn dom_content_loaded_alone_does_not_satisfy_load() {
		let Harness { manager, incoming, _connection } = page_manager().await;
		let main = manager.main_frame().unwrap();
		let watcher = LifecycleWatcher::new(&manager, &main, &[WaitUntil::Load], None);

		// New loader commits, then only DOMContentLoaded arrives.
		lifecycle(&incoming, "F1", "L9", "init");
		navigated(&incoming, "F1", "L9");
		lifecycle(&incoming, "F1", "L9", "DOMContentLoaded");

		let pending = watcher.wait("https://example.com/next", Duration::from_millis(100)).await;
		assert!(pending.unwrap_err().is_timeout());

		// load resolves it.
		lifecycle(&incoming, "F1", "L9", "load");
		watcher
			.wait("https://example.com/next", Duration::from_secs(1))
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn waits_for_loading_children_too() {
		let Harness { manager, incoming, _connection } = page_manager().await;
		let main = manager.main_frame().unwrap();

		// The child started loading, so completion must include it.
		incoming
			.send(
				serde_json::json!({
					"method": "Page.frameStartedLoading",
					"params": {"frameId": "F2"},
					"sessionId": "S1",
				})
				.to_string(),
			)
			.unwrap();
		tokio::time::sleep(Duration::from_millis(20)).await;

		let watcher = LifecycleWatcher::new(&manager, &main, &[WaitUntil::Load], None);
		lifecycle(&incoming, "F1", "L9", "init");
		navigated(&incoming, "F1", "L9");
		lifecycle(&incoming, "F1", "L9", "load");

		let pending = watcher.wait("u", Duration::from_millis(100)).await;
		assert!(pending.unwrap_err().is_timeout());

		lifecycle(&incoming, "F2", "L2", "load");
		watcher.wait("u", Duration::from_secs(1)).await.unwrap();
	}

	#[tokio::test]
	async fn same_document_navigation_counts_as_navigated() {
		let Harness { manager, incoming, _connection } = page_manager().await;
		let main = manager.main_frame().unwrap();

		// Current document already has load; only the navigation part
		// is missing.
		lifecycle(&incoming, "F1", "L1", "load");
		tokio::time::sleep(Duration::from_millis(20)).await;

		let watcher = LifecycleWatcher::new(&manager, &main, &[WaitUntil::Load], None);
		let pending = watcher.wait("u", Duration::from_millis(100)).await;
		assert!(pending.unwrap_err().is_timeout());

		incoming
			.send(
				serde_json::json!({
					"method": "Page.navigatedWithinDocument",
					"params": {"frameId": "F1", "url": "https://example.com/#anchor"},
					"sessionId": "S1",
				})
				.to_string(),
			)
			.unwrap();
		watcher.wait("u", Duration::from_secs(1)).await.unwrap();
		assert_eq!(main.url(), "https://example.com/#anchor");
	}

	#[tokio::test]
	async fn frame_detach_terminates_the_wait() {
		let Harness { manager, incoming, _connection } = page_manager().await;
		let child = manager.frame("F2").unwrap();
		let watcher = LifecycleWatcher::new(&manager, &child, &[WaitUntil::Load], None);

		incoming
			.send(
				serde_json::json!({
					"method": "Page.frameDetached",
					"params": {"frameId": "F2", "reason": "remove"},
					"sessionId": "S1",
				})
				.to_string(),
			)
			.unwrap();

		let err = watcher.wait("u", Duration::from_secs(1)).await.unwrap_err();
		assert_eq!(err.to_string(), "Evaluation failed: Navigating frame was detached");
	}

	#[tokio::test]
	async fn network_idle_maps_to_its_lifecycle_milestone() {
		let Harness { manager, incoming, _connection } = page_manager().await;
		let main = manager.main_frame().unwrap();
		let watcher = LifecycleWatcher::new(&manager, &main, &[WaitUntil::NetworkIdle0], None);

		lifecycle(&incoming, "F1", "L9", "init");
		navigated(&incoming, "F1", "L9");
		lifecycle(&incoming, "F1", "L9", "load");
		let pending = watcher.wait("u", Duration::from_millis(100)).await;
		assert!(pending.unwrap_err().is_timeout());

		lifecycle(&incoming, "F1", "L9", "networkIdle");
		watcher.wait("u", Duration::from_secs(1)).await.unwrap();
	}
}
