//! Discovers targets, tracks attachment and gates initialization.
//!
//! Per target the manager walks discovered → available → attached →
//! destroyed. Discovery and attachment are decoupled event streams:
//! an attach may precede its discovery and vice versa, so attach
//! handling lazily constructs the [`Target`] when needed. An
//! initialization barrier holds [`initialize`] until every target
//! known at startup has attached, been filtered out, or gone away.
//!
//! [`initialize`]: TargetManager::initialize

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use cdp_protocol::target::{
	AttachedToTargetEvent, FilterEntry, SetAutoAttachParams, SetDiscoverTargetsParams,
	TargetCreatedEvent, TargetDestroyedEvent, TargetInfo, TargetInfoChangedEvent,
};
use cdp_runtime::events::EventBus;
use cdp_runtime::{CdpSession, Connection, ConnectionEvent, ProtocolEvent, Result, SessionEvent};

use crate::target::Target;
use crate::util::Deferred;

/// Keeps a target out of the available set. Filtered targets are
/// still tracked in the discovered set so destroy events match.
pub type TargetFilter = Arc<dyn Fn(&TargetInfo) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum TargetEvent {
	/// The target attached and passed the filter.
	Available(Arc<Target>),
	/// The target detached or was destroyed.
	Gone(Arc<Target>),
	/// An initialized target's URL changed.
	Changed {
		target: Arc<Target>,
		previous_url: String,
	},
	/// Raw discovery, before filtering and attachment.
	Discovered(TargetInfo),
}

pub struct TargetManager {
	connection: Arc<Connection>,
	filter: Option<TargetFilter>,
	discovered: Mutex<HashMap<String, TargetInfo>>,
	attached: Mutex<HashMap<String, Arc<Target>>>,
	by_session: Mutex<HashMap<Arc<str>, Arc<Target>>>,
	ignored: Mutex<HashSet<String>>,
	/// Targets known at startup that must settle before
	/// [`TargetManager::initialize`] resolves.
	targets_for_init: Mutex<HashSet<String>>,
	barrier_armed: AtomicBool,
	init_done: Deferred<()>,
	events: EventBus<TargetEvent>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TargetManager {
	pub fn new(connection: Arc<Connection>, filter: Option<TargetFilter>) -> Arc<Self> {
		Arc::new(Self {
			connection,
			filter,
			discovered: Mutex::new(HashMap::new()),
			attached: Mutex::new(HashMap::new()),
			by_session: Mutex::new(HashMap::new()),
			ignored: Mutex::new(HashSet::new()),
			targets_for_init: Mutex::new(HashSet::new()),
			barrier_armed: AtomicBool::new(false),
			init_done: Deferred::new(),
			events: EventBus::new(1024),
			tasks: Mutex::new(Vec::new()),
		})
	}

	/// Enables discovery and auto-attach, then waits for every target
	/// known at startup to settle.
	pub async fn initialize(self: &Arc<Self>) -> Result<()> {
		self.spawn_connection_listener();

		let discover = SetDiscoverTargetsParams {
			discover: true,
			// Tabs duplicate their page target; skip them.
			filter: Some(vec![
				FilterEntry {
					kind: Some("tab".to_string()),
					exclude: Some(true),
				},
				FilterEntry::default(),
			]),
		};
		self.connection
			.send("Target.setDiscoverTargets", serde_json::to_value(&discover)?)
			.await?;

		// Frames are dispatched in order, so every pre-existing
		// target's discovery event has been processed by now.
		self.store_existing_targets_for_init();
		self.barrier_armed.store(true, Ordering::SeqCst);

		self.connection
			.send(
				"Target.setAutoAttach",
				serde_json::to_value(&auto_attach_params())?,
			)
			.await?;
		self.finish_initialization_if_ready(None);
		self.init_done.wait().await
	}

	pub fn subscribe(&self) -> broadcast::Receiver<TargetEvent> {
		self.events.subscribe()
	}

	/// All currently attached targets.
	pub fn targets(&self) -> Vec<Arc<Target>> {
		self.attached.lock().values().cloned().collect()
	}

	pub fn target(&self, target_id: &str) -> Option<Arc<Target>> {
		self.attached.lock().get(target_id).cloned()
	}

	pub fn target_by_session(&self, session_id: &str) -> Option<Arc<Target>> {
		self.by_session.lock().get(session_id).cloned()
	}

	pub fn dispose(&self) {
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

	fn store_existing_targets_for_init(&self) {
		let discovered = self.discovered.lock();
		let mut for_init = self.targets_for_init.lock();
		for (target_id, info) in discovered.iter() {
			let filtered_out = self
				.filter
				.as_ref()
				.is_some_and(|filter| !filter(info));
			if !filtered_out && info.kind != "browser" {
				for_init.insert(target_id.clone());
			}
		}
	}

	fn finish_initialization_if_ready(&self, target_id: Option<&str>) {
		if let Some(target_id) = target_id {
			self.targets_for_init.lock().remove(target_id);
		}
		if self.barrier_armed.load(Ordering::SeqCst) && self.targets_for_init.lock().is_empty() {
			self.init_done.resolve(());
		}
	}

	fn spawn_connection_listener(self: &Arc<Self>) {
		let weak = Arc::downgrade(self);
		let mut events = self.connection.subscribe();
		let task = tokio::spawn(async move {
			loop {
				let event = match events.recv().await {
					Ok(event) => event,
					Err(broadcast::error::RecvError::Lagged(n)) => {
						tracing::warn!(skipped = n, "target event stream lagged");
						continue;
					}
					Err(broadcast::error::RecvError::Closed) => break,
				};
				let Some(manager) = weak.upgrade() else {
					break;
				};
				match event {
					ConnectionEvent::Event(event) => manager.handle_protocol_event(&event),
					ConnectionEvent::SessionDetached(session) => {
						manager.on_session_detached(session.id());
					}
					ConnectionEvent::SessionAttached(_) => {}
					ConnectionEvent::Disconnected => break,
				}
			}
		});
		self.track(task);
	}

	/// Nested targets (workers under a page) announce their attach on
	/// the parent session rather than the browser connection.
	fn spawn_session_listener(self: &Arc<Self>, session: &Arc<CdpSession>) {
		let weak = Arc::downgrade(self);
		let mut events = session.subscribe();
		let task = tokio::spawn(async move {
			loop {
				let event = match events.recv().await {
					Ok(SessionEvent::Event(event)) => event,
					Ok(SessionEvent::Disconnected) => break,
					Err(broadcast::error::RecvError::Lagged(_)) => continue,
					Err(broadcast::error::RecvError::Closed) => break,
				};
				let Some(manager) = weak.upgrade() else {
					break;
				};
				if event.method.as_ref() == "Target.attachedToTarget" {
					manager.handle_protocol_event(&event);
				}
			}
		});
		self.track(task);
	}

	fn handle_protocol_event(self: &Arc<Self>, event: &ProtocolEvent) {
		let params = event.params.as_ref();
		match event.method.as_ref() {
			"Target.targetCreated" => {
				if let Ok(e) = serde_json::from_value::<TargetCreatedEvent>(params.clone()) {
					self.on_target_created(e.target_info);
				}
			}
			"Target.targetDestroyed" => {
				if let Ok(e) = serde_json::from_value::<TargetDestroyedEvent>(params.clone()) {
					self.on_target_destroyed(&e.target_id);
				}
			}
			"Target.targetInfoChanged" => {
				if let Ok(e) = serde_json::from_value::<TargetInfoChangedEvent>(params.clone()) {
					self.on_target_info_changed(e.target_info);
				}
			}
			"Target.attachedToTarget" => {
				if let Ok(e) = serde_json::from_value::<AttachedToTargetEvent>(params.clone()) {
					self.on_attached(e);
				}
			}
			_ => {}
		}
	}

	fn on_target_created(self: &Arc<Self>, info: TargetInfo) {
		self.discovered
			.lock()
			.insert(info.target_id.clone(), info.clone());
		self.events.emit(TargetEvent::Discovered(info));
	}

	fn on_target_destroyed(self: &Arc<Self>, target_id: &str) {
		self.discovered.lock().remove(target_id);
		self.finish_initialization_if_ready(Some(target_id));
		let Some(target) = self.attached.lock().remove(target_id) else {
			return;
		};
		target.abort_initialization();
		let manager = Arc::clone(self);
		tokio::spawn(async move {
			if let Some(page) = target.cached_page().await {
				page.mark_closed();
			}
			manager.events.emit(TargetEvent::Gone(target));
		});
	}

	fn on_target_info_changed(self: &Arc<Self>, info: TargetInfo) {
		self.discovered
			.lock()
			.insert(info.target_id.clone(), info.clone());
		if self.ignored.lock().contains(&info.target_id) {
			return;
		}
		let Some(target) = self.target(&info.target_id) else {
			return;
		};
		let previous_url = target.url();
		let was_initialized = target.is_initialized();
		target.info_changed(info);
		if !was_initialized {
			if target.maybe_initialize() {
				self.events.emit(TargetEvent::Available(Arc::clone(&target)));
				self.finish_initialization_if_ready(Some(&target.id()));
			}
		} else if previous_url != target.url() {
			self.events.emit(TargetEvent::Changed {
				target,
				previous_url,
			});
		}
	}

	fn on_attached(self: &Arc<Self>, event: AttachedToTargetEvent) {
		let Some(session) = self.connection.session(&event.session_id) else {
			tracing::debug!(session_id = %event.session_id, "attach for unknown session");
			return;
		};
		let info = event.target_info;
		let target_id = info.target_id.clone();

		// Auto-attached service workers cannot be driven from here;
		// release them without surfacing a target.
		if info.kind == "service_worker" && self.connection.is_auto_attached(&target_id) {
			self.finish_initialization_if_ready(Some(&target_id));
			tokio::spawn(async move {
				let _ = session.detach().await;
			});
			return;
		}

		if self.filter.as_ref().is_some_and(|filter| !filter(&info)) {
			self.ignored.lock().insert(target_id.clone());
			self.finish_initialization_if_ready(Some(&target_id));
			tokio::spawn(async move {
				let _ = session.detach().await;
			});
			return;
		}

		// Attach may precede discovery; fall back to the attach
		// event's own snapshot.
		let known = self
			.discovered
			.lock()
			.get(&target_id)
			.cloned()
			.unwrap_or_else(|| info.clone());
		let target = self
			.attached
			.lock()
			.entry(target_id.clone())
			.or_insert_with(|| Target::new(known, Arc::downgrade(&self.connection)))
			.clone();
		target.set_session_id(Arc::clone(session.id()));
		self.by_session
			.lock()
			.insert(Arc::clone(session.id()), Arc::clone(&target));
		self.spawn_session_listener(&session);

		if target.maybe_initialize() {
			self.events.emit(TargetEvent::Available(Arc::clone(&target)));
		}

		let manager = Arc::clone(self);
		tokio::spawn(async move {
			let auto_attach = match serde_json::to_value(&auto_attach_params()) {
				Ok(params) => params,
				Err(_) => return,
			};
			if let Err(error) = session.send("Target.setAutoAttach", auto_attach).await {
				tracing::debug!(%error, "nested auto-attach failed");
			}
			if event.waiting_for_debugger {
				if let Err(error) = session
					.send("Runtime.runIfWaitingForDebugger", serde_json::json!({}))
					.await
				{
					tracing::debug!(%error, "runIfWaitingForDebugger failed");
				}
			}
			manager.finish_initialization_if_ready(Some(&target_id));
		});
	}

	fn on_session_detached(self: &Arc<Self>, session_id: &Arc<str>) {
		let Some(target) = self.by_session.lock().remove(session_id) else {
			return;
		};
		// Gone fires at most once per target, whichever of detach and
		// destroy lands first.
		if self.attached.lock().remove(&target.id()).is_some() {
			self.finish_initialization_if_ready(Some(&target.id()));
			self.events.emit(TargetEvent::Gone(target));
		}
	}
}

impl Drop for TargetManager {
	fn drop(&mut self) {
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
	}
}

fn auto_attach_params() -> SetAutoAttachParams {
	SetAutoAttachParams {
		auto_attach: true,
		wait_for_debugger_on_start: true,
		flatten: true,
		filter: None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::target::TargetKind;
	use cdp_runtime::transport::bridge::{self, BridgeHandle};
	use std::time::Duration;

	fn target_created_json(target_id: &str, kind: &str, url: &str) -> String {
		serde_json::json!({
			"method": "Target.targetCreated",
			"params": {"targetInfo": {
				"targetId": target_id,
				"type": kind,
				"title": "",
				"url": url,
				"attached": false,
			}},
		})
		.to_string()
	}

	fn attached_json(session_id: &str, target_id: &str, kind: &str, url: &str) -> String {
		serde_json::json!({
			"method": "Target.attachedToTarget",
			"params": {
				"sessionId": session_id,
				"targetInfo": {
					"targetId": target_id,
					"type": kind,
					"title": "",
					"url": url,
					"attached": true,
				},
				"waitingForDebugger": false,
			},
		})
		.to_string()
	}

	/// Replies to commands like a browser that already has one page:
	/// discovery announces it, auto-attach attaches it.
	fn browser_with_one_page(mut handle: BridgeHandle) -> tokio::task::JoinHandle<()> {
		let incoming = handle.incoming.clone();
		tokio::spawn(async move {
			while let Some(frame) = handle.outgoing.recv().await {
				let command: serde_json::Value = serde_json::from_str(&frame).unwrap();
				let Some(id) = command.get("id").cloned() else {
					continue;
				};
				let method = command["method"].as_str().unwrap_or_default();
				let root = command.get("sessionId").is_none();
				if method == "Target.setDiscoverTargets" && root {
					incoming
						.send(target_created_json("T1", "page", "http://a.test/"))
						.unwrap();
				}
				if method == "Target.setAutoAttach" && root {
					incoming
						.send(attached_json("S1", "T1", "page", "http://a.test/"))
						.unwrap();
				}
				let mut reply = serde_json::json!({"id": id, "result": {}});
				if let Some(session_id) = command.get("sessionId") {
					reply["sessionId"] = session_id.clone();
				}
				incoming.send(reply.to_string()).unwrap();
			}
		})
	}

	#[tokio::test]
	async fn initialize_waits_for_the_starting_targets_to_attach() {
		let (parts, handle) = bridge::pair();
		let connection = Connection::with_transport(parts);
		let _browser = browser_with_one_page(handle);

		let manager = TargetManager::new(Arc::clone(&connection), None);
		let mut events = manager.subscribe();
		manager.initialize().await.unwrap();

		let target = manager.target("T1").unwrap();
		assert_eq!(target.kind(), TargetKind::Page);
		assert!(target.is_initialized());
		assert!(manager.target_by_session("S1").is_some());

		// Discovered precedes Available.
		let TargetEvent::Discovered(info) = events.recv().await.unwrap() else {
			panic!("expected discovery first");
		};
		assert_eq!(info.target_id, "T1");
		let TargetEvent::Available(available) = events.recv().await.unwrap() else {
			panic!("expected availability");
		};
		assert_eq!(available.id(), "T1");
	}

	#[tokio::test]
	async fn attach_before_discovery_still_produces_a_target() {
		let (parts, handle) = bridge::pair();
		let connection = Connection::with_transport(parts);
		let incoming = handle.incoming.clone();
		let _responder = crate::test_util::auto_respond(handle, |_, _| serde_json::json!({}));

		let manager = TargetManager::new(Arc::clone(&connection), None);
		manager.spawn_connection_listener();

		incoming
			.send(attached_json("S1", "T1", "page", "http://a.test/"))
			.unwrap();
		tokio::time::timeout(Duration::from_secs(1), async {
			while manager.target("T1").is_none() {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap();
		assert!(manager.target("T1").unwrap().is_initialized());
	}

	#[tokio::test]
	async fn filtered_targets_are_ignored_but_still_tracked() {
		let (parts, handle) = bridge::pair();
		let connection = Connection::with_transport(parts);
		let incoming = handle.incoming.clone();
		let _responder = crate::test_util::auto_respond(handle, |_, _| serde_json::json!({}));

		let filter: TargetFilter = Arc::new(|info: &TargetInfo| info.kind != "other");
		let manager = TargetManager::new(Arc::clone(&connection), Some(filter));
		manager.spawn_connection_listener();
		let mut events = manager.subscribe();

		incoming
			.send(target_created_json("T9", "other", "devtools://x"))
			.unwrap();
		incoming
			.send(attached_json("S9", "T9", "other", "devtools://x"))
			.unwrap();

		let TargetEvent::Discovered(_) = events.recv().await.unwrap() else {
			panic!("discovery still fires for filtered targets");
		};
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert!(events.try_recv().is_err(), "no availability for filtered");
		assert!(manager.target("T9").is_none());
		assert!(manager.discovered.lock().contains_key("T9"));
		assert!(manager.ignored.lock().contains("T9"));
	}

	#[tokio::test]
	async fn auto_attached_service_workers_detach_silently() {
		let (parts, mut handle) = bridge::pair();
		let connection = Connection::with_transport(parts);
		let incoming = handle.incoming.clone();

		let manager = TargetManager::new(Arc::clone(&connection), None);
		manager.spawn_connection_listener();
		let mut events = manager.subscribe();

		incoming
			.send(attached_json("SW1", "TW1", "service_worker", "http://a.test/sw.js"))
			.unwrap();

		// The manager must release the session rather than expose it.
		let detach = tokio::time::timeout(Duration::from_secs(1), async {
			loop {
				let frame = handle.outgoing.recv().await.unwrap();
				let command: serde_json::Value = serde_json::from_str(&frame).unwrap();
				if command["method"] == "Target.detachFromTarget" {
					let id = command["id"].clone();
					incoming
						.send(serde_json::json!({"id": id, "result": {}}).to_string())
						.unwrap();
					break;
				}
			}
		})
		.await;
		detach.unwrap();
		assert!(events.try_recv().is_err());
		assert!(manager.target("TW1").is_none());
	}

	#[tokio::test]
	async fn url_changes_emit_changed_only_once_initialized() {
		let (parts, handle) = bridge::pair();
		let connection = Connection::with_transport(parts);
		let incoming = handle.incoming.clone();
		let _responder = crate::test_util::auto_respond(handle, |_, _| serde_json::json!({}));

		let manager = TargetManager::new(Arc::clone(&connection), None);
		manager.spawn_connection_listener();
		let mut events = manager.subscribe();

		// A fresh page attaches with no committed URL.
		incoming.send(attached_json("S1", "T1", "page", "")).unwrap();
		tokio::time::timeout(Duration::from_secs(1), async {
			while manager.target("T1").is_none() {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap();
		assert!(!manager.target("T1").unwrap().is_initialized());

		// First committed URL initializes and makes it available.
		incoming
			.send(
				serde_json::json!({
					"method": "Target.targetInfoChanged",
					"params": {"targetInfo": {
						"targetId": "T1",
						"type": "page",
						"title": "",
						"url": "http://a.test/",
						"attached": true,
					}},
				})
				.to_string(),
			)
			.unwrap();
		loop {
			if let TargetEvent::Available(target) = events.recv().await.unwrap() {
				assert_eq!(target.url(), "http://a.test/");
				break;
			}
		}

		// Later URL changes surface as Changed with the old URL.
		incoming
			.send(
				serde_json::json!({
					"method": "Target.targetInfoChanged",
					"params": {"targetInfo": {
						"targetId": "T1",
						"type": "page",
						"title": "",
						"url": "http://b.test/",
						"attached": true,
					}},
				})
				.to_string(),
			)
			.unwrap();
		loop {
			if let TargetEvent::Changed {
				target,
				previous_url,
			} = events.recv().await.unwrap()
			{
				assert_eq!(previous_url, "http://a.test/");
				assert_eq!(target.url(), "http://b.test/");
				break;
			}
		}
	}

	#[tokio::test]
	async fn detach_and_destroy_emit_gone_only_once() {
		let (parts, handle) = bridge::pair();
		let connection = Connection::with_transport(parts);
		let incoming = handle.incoming.clone();
		let _responder = crate::test_util::auto_respond(handle, |_, _| serde_json::json!({}));

		let manager = TargetManager::new(Arc::clone(&connection), None);
		manager.spawn_connection_listener();
		let mut events = manager.subscribe();

		incoming
			.send(attached_json("S1", "T1", "page", "http://a.test/"))
			.unwrap();
		loop {
			if let TargetEvent::Available(_) = events.recv().await.unwrap() {
				break;
			}
		}

		incoming
			.send(
				serde_json::json!({
					"method": "Target.detachedFromTarget",
					"params": {"sessionId": "S1", "targetId": "T1"},
				})
				.to_string(),
			)
			.unwrap();
		incoming
			.send(
				serde_json::json!({
					"method": "Target.targetDestroyed",
					"params": {"targetId": "T1"},
				})
				.to_string(),
			)
			.unwrap();

		let TargetEvent::Gone(target) = events.recv().await.unwrap() else {
			panic!("expected the target to go away");
		};
		assert_eq!(target.id(), "T1");
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert!(events.try_recv().is_err(), "Gone must not double-fire");
	}
}
