//! The top-level handle over one browser connection.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use cdp_runtime::events::EventBus;
use cdp_runtime::{Connection, ConnectionEvent, Error, Result};

use crate::page::Page;
use crate::target::Target;
use crate::target_manager::{TargetEvent, TargetFilter, TargetManager};

#[derive(Clone)]
pub enum BrowserEvent {
	TargetCreated(Arc<Target>),
	TargetChanged(Arc<Target>),
	TargetDestroyed(Arc<Target>),
	Disconnected,
}

pub struct Browser {
	connection: Arc<Connection>,
	targets: Arc<TargetManager>,
	events: EventBus<BrowserEvent>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Browser {
	/// Connects to a browser's WebSocket debugging endpoint and waits
	/// for the initial targets to settle.
	pub async fn connect(url: &str, filter: Option<TargetFilter>) -> Result<Arc<Self>> {
		let connection = Connection::connect(url).await?;
		Self::with_connection(connection, filter).await
	}

	/// Builds a browser over an already-established connection.
	pub async fn with_connection(
		connection: Arc<Connection>,
		filter: Option<TargetFilter>,
	) -> Result<Arc<Self>> {
		let targets = TargetManager::new(Arc::clone(&connection), filter);
		let browser = Arc::new(Self {
			connection: Arc::clone(&connection),
			targets: Arc::clone(&targets),
			events: EventBus::new(256),
			tasks: Mutex::new(Vec::new()),
		});
		browser.spawn_target_listener();
		browser.spawn_disconnect_listener();
		targets.initialize().await?;
		Ok(browser)
	}

	pub fn connection(&self) -> &Arc<Connection> {
		&self.connection
	}

	pub fn target_manager(&self) -> &Arc<TargetManager> {
		&self.targets
	}

	pub fn targets(&self) -> Vec<Arc<Target>> {
		self.targets.targets()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<BrowserEvent> {
		self.events.subscribe()
	}

	/// The page surfaces of every attached page target.
	pub async fn pages(&self) -> Result<Vec<Arc<Page>>> {
		let mut pages = Vec::new();
		for target in self.targets() {
			if let Some(page) = target.page().await? {
				pages.push(page);
			}
		}
		Ok(pages)
	}

	/// Waits for the first attached target matching `predicate`.
	pub async fn wait_for_target(
		&self,
		timeout: Duration,
		predicate: impl Fn(&Arc<Target>) -> bool + Send + Sync + 'static,
	) -> Result<Arc<Target>> {
		if let Some(target) = self.targets().into_iter().find(|t| predicate(t)) {
			return Ok(target);
		}
		let event = self
			.events
			.wait_for(timeout, move |event| match event {
				BrowserEvent::TargetCreated(target) | BrowserEvent::TargetChanged(target) => {
					predicate(target)
				}
				_ => false,
			})
			.await?;
		match event {
			BrowserEvent::TargetCreated(target) | BrowserEvent::TargetChanged(target) => Ok(target),
			_ => Err(Error::InvalidArgument(
				"target wait resolved with a non-target event".to_string(),
			)),
		}
	}

	pub fn is_connected(&self) -> bool {
		!self.connection.is_closed()
	}

	/// Asks the browser process to exit, then drops the connection.
	pub async fn close(&self) -> Result<()> {
		self.connection
			.send("Browser.close", serde_json::json!({}))
			.await?;
		self.disconnect();
		Ok(())
	}

	/// Drops the connection, leaving the browser running.
	pub fn disconnect(&self) {
		self.targets.dispose();
		self.connection.dispose();
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
	}

	fn spawn_target_listener(self: &Arc<Self>) {
		let weak = Arc::downgrade(self);
		let mut events = self.targets.subscribe();
		let task = tokio::spawn(async move {
			loop {
				let event = match events.recv().await {
					Ok(event) => event,
					Err(broadcast::error::RecvError::Lagged(_)) => continue,
					Err(broadcast::error::RecvError::Closed) => break,
				};
				let Some(browser) = weak.upgrade() else {
					break;
				};
				match event {
					TargetEvent::Available(target) => {
						browser.wire_popup(&target);
						browser.events.emit(BrowserEvent::TargetCreated(target));
					}
					TargetEvent::Gone(target) => {
						browser.events.emit(BrowserEvent::TargetDestroyed(target));
					}
					TargetEvent::Changed { target, .. } => {
						browser.events.emit(BrowserEvent::TargetChanged(target));
					}
					TargetEvent::Discovered(_) => {}
				}
			}
		});
		self.tasks.lock().push(task);
	}

	fn spawn_disconnect_listener(self: &Arc<Self>) {
		let weak = Arc::downgrade(self);
		let mut events = self.connection.subscribe();
		let task = tokio::spawn(async move {
			loop {
				match events.recv().await {
					Ok(ConnectionEvent::Disconnected) => {
						if let Some(browser) = weak.upgrade() {
							browser.events.emit(BrowserEvent::Disconnected);
						}
						break;
					}
					Ok(_) => continue,
					Err(broadcast::error::RecvError::Lagged(_)) => continue,
					Err(broadcast::error::RecvError::Closed) => break,
				}
			}
		});
		self.tasks.lock().push(task);
	}

	/// Routes a freshly available page opened by another page to the
	/// opener's event bus as a popup.
	fn wire_popup(self: &Arc<Self>, target: &Arc<Target>) {
		let Some(opener_id) = target.opener_id() else {
			return;
		};
		if !target.kind().supports_page() {
			return;
		}
		let targets = Arc::clone(&self.targets);
		let target = Arc::clone(target);
		tokio::spawn(async move {
			let Some(opener) = targets.target(&opener_id) else {
				return;
			};
			// Only pages someone is already driving observe popups.
			let Some(opener_page) = opener.cached_page().await else {
				return;
			};
			match target.page().await {
				Ok(Some(popup)) => opener_page.emit_popup(popup),
				Ok(None) => {}
				Err(error) => {
					tracing::debug!(%error, "failed to build popup page");
				}
			}
		});
	}
}

impl Drop for Browser {
	fn drop(&mut self) {
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::target::TargetKind;
	use cdp_runtime::transport::bridge::{self, BridgeHandle};

	fn scripted_browser(mut handle: BridgeHandle) -> tokio::task::JoinHandle<()> {
		let incoming = handle.incoming.clone();
		tokio::spawn(async move {
			while let Some(frame) = handle.outgoing.recv().await {
				let command: serde_json::Value = serde_json::from_str(&frame).unwrap();
				let Some(id) = command.get("id").cloned() else {
					continue;
				};
				let method = command["method"].as_str().unwrap_or_default();
				if method == "Target.setAutoAttach" && command.get("sessionId").is_none() {
					incoming
						.send(
							serde_json::json!({
								"method": "Target.attachedToTarget",
								"params": {
									"sessionId": "S1",
									"targetInfo": {
										"targetId": "T1",
										"type": "page",
										"title": "",
										"url": "http://a.test/",
										"attached": true,
									},
									"waitingForDebugger": false,
								},
							})
							.to_string(),
						)
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
	async fn connect_exposes_the_attached_page_target() {
		let (parts, handle) = bridge::pair();
		let connection = Connection::with_transport(parts);
		let _browser_side = scripted_browser(handle);

		let browser = Browser::with_connection(connection, None).await.unwrap();
		let target = browser
			.wait_for_target(Duration::from_secs(1), |t| t.kind() == TargetKind::Page)
			.await
			.unwrap();
		assert_eq!(target.id(), "T1");
		assert!(browser.is_connected());
	}

	#[tokio::test]
	async fn disconnect_surfaces_on_the_browser_bus() {
		let (parts, handle) = bridge::pair();
		let connection = Connection::with_transport(parts);
		let _browser_side = scripted_browser(handle);

		let browser = Browser::with_connection(Arc::clone(&connection), None)
			.await
			.unwrap();
		let mut events = browser.subscribe();
		connection.dispose();
		loop {
			if let BrowserEvent::Disconnected = events.recv().await.unwrap() {
				break;
			}
		}
		assert!(!browser.is_connected());
	}
}
