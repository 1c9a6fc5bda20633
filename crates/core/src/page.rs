//! A single page target: navigation, evaluation and prompts.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use cdp_protocol::page::JavascriptDialogOpeningEvent;
use cdp_runtime::events::EventBus;
use cdp_runtime::{CdpSession, Connection, Error, ProtocolEvent, Result, SessionEvent};

use crate::device_prompt::{DeviceRequestPrompt, DeviceRequestPromptManager};
use crate::dialog::Dialog;
use crate::execution_context::RemoteHandle;
use crate::frame::Frame;
use crate::frame_manager::FrameManager;
use crate::lifecycle_watcher::{LifecycleWatcher, WaitUntil};
use crate::network::{HttpResponse, NetworkManager};
use crate::timeout_settings::TimeoutSettings;
use crate::util::AbortSignal;
use crate::wait_task::{Polling, WaitTask};

#[derive(Clone)]
pub enum PageEvent {
	/// A JavaScript dialog opened and blocks the page.
	Dialog(Arc<Dialog>),
	/// A page this one opened became available.
	Popup(Arc<Page>),
	Close,
}

/// Options for [`Page::goto`] and the other navigation waits.
#[derive(Default, Clone)]
pub struct GotoOptions {
	/// Lifecycle milestones to wait for; defaults to [`WaitUntil::Load`].
	pub wait_until: Vec<WaitUntil>,
	/// Overrides the page's navigation timeout.
	pub timeout: Option<Duration>,
	pub referer: Option<String>,
	pub signal: Option<AbortSignal>,
}

pub struct Page {
	connection: Weak<Connection>,
	session: Arc<CdpSession>,
	target_id: String,
	frame_manager: Arc<FrameManager>,
	network: Arc<NetworkManager>,
	timeouts: TimeoutSettings,
	prompts: DeviceRequestPromptManager,
	events: EventBus<PageEvent>,
	closed: AtomicBool,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Page {
	/// Attaches the page machinery to an already-attached session:
	/// frame tree, network reconciliation and dialog routing.
	pub async fn new(
		connection: &Arc<Connection>,
		session: Arc<CdpSession>,
		target_id: &str,
	) -> Result<Arc<Self>> {
		let frame_manager = FrameManager::new(Arc::clone(&session));
		let network = NetworkManager::new(Arc::clone(&session));
		let page = Arc::new(Self {
			connection: Arc::downgrade(connection),
			session: Arc::clone(&session),
			target_id: target_id.to_string(),
			frame_manager: Arc::clone(&frame_manager),
			network: Arc::clone(&network),
			timeouts: TimeoutSettings::new(),
			prompts: DeviceRequestPromptManager::new(Arc::clone(&session)),
			events: EventBus::new(256),
			closed: AtomicBool::new(false),
			tasks: Mutex::new(Vec::new()),
		});
		page.spawn_session_listener();
		frame_manager.initialize().await?;
		network.initialize().await?;
		Ok(page)
	}

	pub fn session(&self) -> &Arc<CdpSession> {
		&self.session
	}

	pub fn target_id(&self) -> &str {
		&self.target_id
	}

	pub fn frames(&self) -> Vec<Arc<Frame>> {
		self.frame_manager.frames()
	}

	pub fn main_frame(&self) -> Result<Arc<Frame>> {
		self.frame_manager
			.main_frame()
			.ok_or_else(|| Error::InvalidArgument("page has no main frame".to_string()))
	}

	pub fn network(&self) -> &Arc<NetworkManager> {
		&self.network
	}

	pub fn timeouts(&self) -> &TimeoutSettings {
		&self.timeouts
	}

	pub fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
		self.events.subscribe()
	}

	pub fn url(&self) -> String {
		self.frame_manager
			.main_frame()
			.map(|frame| frame.url())
			.unwrap_or_default()
	}

	pub async fn title(&self) -> Result<String> {
		let value = self.evaluate("document.title").await?;
		Ok(value.as_str().unwrap_or_default().to_string())
	}

	/// Navigates the main frame and waits for the requested lifecycle
	/// milestones. Resolves with the navigation's main response when
	/// network tracking observed one.
	pub async fn goto(&self, url: &str, options: GotoOptions) -> Result<Option<Arc<HttpResponse>>> {
		let frame = self.main_frame()?;
		let timeout = options
			.timeout
			.unwrap_or_else(|| self.timeouts.navigation_timeout());
		let watcher = LifecycleWatcher::new(
			&self.frame_manager,
			&frame,
			&effective_wait_until(&options.wait_until),
			Some(&self.network),
		);
		let navigation = async {
			self.frame_manager
				.navigate_frame(&frame, url, options.referer.clone())
				.await?;
			watcher.wait(url, timeout).await
		};
		let outcome = tokio::select! {
			outcome = navigation => outcome,
			reason = abort_or_never(options.signal.clone()) => Err(Error::Aborted(reason)),
		};
		watcher.dispose();
		outcome
	}

	/// Waits for the next navigation of the main frame without
	/// triggering one.
	pub async fn wait_for_navigation(
		&self,
		options: GotoOptions,
	) -> Result<Option<Arc<HttpResponse>>> {
		let frame = self.main_frame()?;
		let timeout = options
			.timeout
			.unwrap_or_else(|| self.timeouts.navigation_timeout());
		let watcher = LifecycleWatcher::new(
			&self.frame_manager,
			&frame,
			&effective_wait_until(&options.wait_until),
			Some(&self.network),
		);
		let url = frame.url();
		let outcome = tokio::select! {
			outcome = watcher.wait(&url, timeout) => outcome,
			reason = abort_or_never(options.signal.clone()) => Err(Error::Aborted(reason)),
		};
		watcher.dispose();
		outcome
	}

	/// Replaces the main frame's document and waits for it to load.
	pub async fn set_content(&self, html: &str, options: GotoOptions) -> Result<()> {
		let frame = self.main_frame()?;
		let timeout = options
			.timeout
			.unwrap_or_else(|| self.timeouts.navigation_timeout());
		let watcher = LifecycleWatcher::new(
			&self.frame_manager,
			&frame,
			&effective_wait_until(&options.wait_until),
			None,
		);
		let write = async {
			frame
				.call_function(
					"html => { document.open(); document.write(html); document.close(); }",
					vec![Value::String(html.to_string())],
				)
				.await?;
			watcher.wait(&frame.url(), timeout).await
		};
		let outcome = tokio::select! {
			outcome = write => outcome,
			reason = abort_or_never(options.signal.clone()) => Err(Error::Aborted(reason)),
		};
		watcher.dispose();
		outcome.map(|_| ())
	}

	/// The full serialized HTML of the main frame's document.
	pub async fn content(&self) -> Result<String> {
		let value = self
			.evaluate(
				"(() => {\
					let content = '';\
					for (const node of document.childNodes) {\
						if (node === document.documentElement) {\
							content += document.documentElement.outerHTML;\
						} else {\
							content += new XMLSerializer().serializeToString(node);\
						}\
					}\
					return content;\
				})()",
			)
			.await?;
		Ok(value.as_str().unwrap_or_default().to_string())
	}

	pub async fn evaluate(&self, expression: &str) -> Result<Value> {
		self.main_frame()?.evaluate(expression).await
	}

	pub async fn call_function(&self, declaration: &str, args: Vec<Value>) -> Result<Value> {
		self.main_frame()?.call_function(declaration, args).await
	}

	pub async fn evaluate_handle(&self, expression: &str) -> Result<RemoteHandle> {
		self.main_frame()?.evaluate_handle(expression).await
	}

	/// Polls `predicate` inside the page until it returns a truthy
	/// value.
	pub async fn wait_for_function(
		&self,
		predicate: &str,
		polling: Polling,
		timeout: Option<Duration>,
		signal: Option<AbortSignal>,
	) -> Result<Value> {
		let frame = self.main_frame()?;
		let task = WaitTask::new(frame.main_world(), predicate, polling);
		let timeout = timeout.unwrap_or_else(|| self.timeouts.timeout());
		task.wait(Some(timeout), signal).await
	}

	/// Waits for the next device chooser (WebBluetooth/WebUSB) prompt.
	pub async fn wait_for_device_prompt(
		&self,
		timeout: Option<Duration>,
		signal: Option<AbortSignal>,
	) -> Result<Arc<DeviceRequestPrompt>> {
		let timeout = timeout.unwrap_or_else(|| self.timeouts.timeout());
		self.prompts.wait_for_prompt(timeout, signal).await
	}

	/// Reloads the page and waits like [`goto`] does.
	///
	/// [`goto`]: Page::goto
	pub async fn reload(&self, options: GotoOptions) -> Result<Option<Arc<HttpResponse>>> {
		let frame = self.main_frame()?;
		let timeout = options
			.timeout
			.unwrap_or_else(|| self.timeouts.navigation_timeout());
		let watcher = LifecycleWatcher::new(
			&self.frame_manager,
			&frame,
			&effective_wait_until(&options.wait_until),
			Some(&self.network),
		);
		let url = frame.url();
		let navigation = async {
			self.session.send("Page.reload", serde_json::json!({})).await?;
			watcher.wait(&url, timeout).await
		};
		let outcome = tokio::select! {
			outcome = navigation => outcome,
			reason = abort_or_never(options.signal.clone()) => Err(Error::Aborted(reason)),
		};
		watcher.dispose();
		outcome
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Asks the browser to close the target. Safe to call twice.
	pub async fn close(&self) -> Result<()> {
		if self.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		let Some(connection) = self.connection.upgrade() else {
			return Ok(());
		};
		connection
			.send(
				"Target.closeTarget",
				serde_json::json!({"targetId": self.target_id}),
			)
			.await?;
		self.events.emit(PageEvent::Close);
		Ok(())
	}

	/// The browser closed the target out from under us.
	pub(crate) fn mark_closed(&self) {
		if !self.closed.swap(true, Ordering::SeqCst) {
			self.events.emit(PageEvent::Close);
		}
		self.frame_manager.dispose();
		self.network.dispose();
	}

	pub(crate) fn emit_popup(&self, popup: Arc<Page>) {
		self.events.emit(PageEvent::Popup(popup));
	}

	fn spawn_session_listener(self: &Arc<Self>) {
		let weak = Arc::downgrade(self);
		let mut events = self.session.subscribe();
		let task = tokio::spawn(async move {
			loop {
				let event = match events.recv().await {
					Ok(SessionEvent::Event(event)) => event,
					Ok(SessionEvent::Disconnected) => {
						if let Some(page) = weak.upgrade() {
							page.mark_closed();
						}
						break;
					}
					Err(broadcast::error::RecvError::Lagged(n)) => {
						tracing::warn!(skipped = n, "page event stream lagged");
						continue;
					}
					Err(broadcast::error::RecvError::Closed) => break,
				};
				let Some(page) = weak.upgrade() else {
					break;
				};
				page.on_session_event(&event);
			}
		});
		self.tasks.lock().push(task);
	}

	fn on_session_event(self: &Arc<Self>, event: &ProtocolEvent) {
		if event.method.as_ref() != "Page.javascriptDialogOpening" {
			return;
		}
		if let Ok(e) =
			serde_json::from_value::<JavascriptDialogOpeningEvent>(event.params.as_ref().clone())
		{
			let dialog = Dialog::new(Arc::clone(&self.session), &e);
			self.events.emit(PageEvent::Dialog(dialog));
		}
	}
}

impl Drop for Page {
	fn drop(&mut self) {
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
	}
}

fn effective_wait_until(requested: &[WaitUntil]) -> Vec<WaitUntil> {
	if requested.is_empty() {
		vec![WaitUntil::Load]
	} else {
		requested.to_vec()
	}
}

async fn abort_or_never(signal: Option<AbortSignal>) -> String {
	match signal {
		Some(signal) => signal.aborted().await,
		None => std::future::pending().await,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_util::{attached_session, auto_respond};

	async fn test_page() -> (
		Arc<Page>,
		tokio::sync::mpsc::UnboundedSender<String>,
		Arc<Connection>,
	) {
		let (connection, session, handle) = attached_session().await;
		let incoming = handle.incoming.clone();
		let _responder = auto_respond(handle, |method, _| match method {
			"Page.getFrameTree" => serde_json::json!({
				"frameTree": {
					"frame": {"id": "F1", "loaderId": "L1", "url": "about:blank"},
				},
			}),
			"Page.createIsolatedWorld" => serde_json::json!({"executionContextId": 9}),
			"Page.navigate" => serde_json::json!({"frameId": "F1", "loaderId": "L2"}),
			"Runtime.evaluate" => serde_json::json!({
				"result": {"type": "string", "value": "hello"},
			}),
			_ => serde_json::json!({}),
		});
		let page = Page::new(&connection, session, "T1").await.unwrap();
		(page, incoming, connection)
	}

	fn session_event(method: &str, params: serde_json::Value) -> String {
		serde_json::json!({"sessionId": "S1", "method": method, "params": params}).to_string()
	}

	#[tokio::test]
	async fn evaluate_runs_in_the_main_frame_world() {
		let (page, incoming, _connection) = test_page().await;
		incoming
			.send(session_event(
				"Runtime.executionContextCreated",
				serde_json::json!({
					"context": {
						"id": 1,
						"origin": "",
						"name": "",
						"auxData": {"frameId": "F1", "isDefault": true},
					},
				}),
			))
			.unwrap();
		let value = page.evaluate("document.title").await.unwrap();
		assert_eq!(value, serde_json::json!("hello"));
	}

	#[tokio::test]
	async fn goto_resolves_once_the_new_document_loads() {
		let (page, incoming, _connection) = test_page().await;
		let navigation = tokio::spawn({
			let page = Arc::clone(&page);
			async move {
				page.goto(
					"http://a.test/",
					GotoOptions {
						timeout: Some(Duration::from_secs(2)),
						..GotoOptions::default()
					},
				)
				.await
			}
		});
		tokio::time::sleep(Duration::from_millis(50)).await;
		incoming
			.send(session_event(
				"Page.lifecycleEvent",
				serde_json::json!({"frameId": "F1", "loaderId": "L2", "name": "init", "timestamp": 1.0}),
			))
			.unwrap();
		incoming
			.send(session_event(
				"Page.lifecycleEvent",
				serde_json::json!({"frameId": "F1", "loaderId": "L2", "name": "load", "timestamp": 2.0}),
			))
			.unwrap();
		let response = navigation.await.unwrap().unwrap();
		assert!(response.is_none(), "no network telemetry was injected");
	}

	#[tokio::test]
	async fn dialog_events_surface_on_the_page_bus() {
		let (page, incoming, _connection) = test_page().await;
		let mut events = page.subscribe();
		incoming
			.send(session_event(
				"Page.javascriptDialogOpening",
				serde_json::json!({
					"url": "about:blank",
					"message": "sure?",
					"type": "confirm",
				}),
			))
			.unwrap();
		let PageEvent::Dialog(dialog) = events.recv().await.unwrap() else {
			panic!("expected a dialog event");
		};
		assert_eq!(dialog.kind(), "confirm");
		assert_eq!(dialog.message(), "sure?");
	}

	#[tokio::test]
	async fn close_is_idempotent() {
		let (page, _incoming, _connection) = test_page().await;
		page.close().await.unwrap();
		assert!(page.is_closed());
		page.close().await.unwrap();
	}

	#[tokio::test]
	async fn aborting_a_navigation_rejects_promptly() {
		let (page, _incoming, _connection) = test_page().await;
		let controller = crate::util::AbortController::new();
		let signal = controller.signal();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(20)).await;
			controller.abort("operator cancelled");
		});
		let error = page
			.wait_for_navigation(GotoOptions {
				timeout: Some(Duration::from_secs(30)),
				signal: Some(signal),
				..GotoOptions::default()
			})
			.await
			.unwrap_err();
		assert!(error.is_aborted());
	}
}
