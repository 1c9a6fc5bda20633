//! Web workers (dedicated, shared, service).

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use cdp_protocol::runtime::ExecutionContextCreatedEvent;
use cdp_runtime::{CdpSession, ProtocolEvent, Result, SessionEvent};

use crate::execution_context::{ExecutionContext, RemoteHandle};
use crate::isolated_world::{IsolatedWorld, WorldKind};

/// A worker's single evaluation surface. The world is fed by the
/// worker's own `Runtime.executionContextCreated`; workers have no
/// frames and no utility world.
pub struct WebWorker {
	session: Arc<CdpSession>,
	url: String,
	world: Arc<IsolatedWorld>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebWorker {
	pub(crate) fn new(session: Arc<CdpSession>, url: &str) -> Arc<Self> {
		let worker = Arc::new(Self {
			session: Arc::clone(&session),
			url: url.to_string(),
			world: IsolatedWorld::new(WorldKind::Main),
			tasks: Mutex::new(Vec::new()),
		});
		worker.spawn_context_listener();
		worker
	}

	/// Enables the Runtime domain so the worker announces its context.
	pub(crate) async fn initialize(&self) -> Result<()> {
		self.session
			.send("Runtime.enable", serde_json::json!({}))
			.await?;
		Ok(())
	}

	pub fn url(&self) -> &str {
		&self.url
	}

	pub fn session(&self) -> &Arc<CdpSession> {
		&self.session
	}

	pub async fn evaluate(&self, expression: &str) -> Result<Value> {
		self.world.evaluate(expression).await
	}

	pub async fn call_function(&self, declaration: &str, args: Vec<Value>) -> Result<Value> {
		self.world.call_function(declaration, args).await
	}

	pub async fn evaluate_handle(&self, expression: &str) -> Result<RemoteHandle> {
		self.world.evaluate_handle(expression).await
	}

	fn spawn_context_listener(self: &Arc<Self>) {
		let weak = Arc::downgrade(self);
		let mut events = self.session.subscribe();
		let task = tokio::spawn(async move {
			loop {
				let event = match events.recv().await {
					Ok(SessionEvent::Event(event)) => event,
					Ok(SessionEvent::Disconnected) => break,
					Err(broadcast::error::RecvError::Lagged(_)) => continue,
					Err(broadcast::error::RecvError::Closed) => break,
				};
				let Some(worker) = weak.upgrade() else {
					break;
				};
				worker.on_session_event(&event);
			}
		});
		self.tasks.lock().push(task);
	}

	fn on_session_event(&self, event: &ProtocolEvent) {
		match event.method.as_ref() {
			"Runtime.executionContextCreated" => {
				if let Ok(e) =
					serde_json::from_value::<ExecutionContextCreatedEvent>(event.params.as_ref().clone())
				{
					let world = Arc::clone(&self.world);
					world.set_context(ExecutionContext::new(
						e.context.id,
						Arc::clone(&self.session),
					));
				}
			}
			"Runtime.executionContextsCleared" => self.world.clear_context(),
			_ => {}
		}
	}
}

impl Drop for WebWorker {
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
	use std::time::Duration;

	#[tokio::test]
	async fn evaluate_waits_for_the_worker_context() {
		let (_connection, session, handle) = attached_session().await;
		let incoming = handle.incoming.clone();
		let _responder = auto_respond(handle, |method, _| match method {
			"Runtime.evaluate" => serde_json::json!({
				"result": {"type": "number", "value": 7},
			}),
			_ => serde_json::json!({}),
		});

		let worker = WebWorker::new(session, "http://a.test/worker.js");
		worker.initialize().await.unwrap();

		let evaluation = tokio::spawn({
			let worker = Arc::clone(&worker);
			async move { worker.evaluate("7").await }
		});
		tokio::time::sleep(Duration::from_millis(20)).await;
		incoming
			.send(
				serde_json::json!({
					"sessionId": "S1",
					"method": "Runtime.executionContextCreated",
					"params": {"context": {"id": 1, "origin": "", "name": ""}},
				})
				.to_string(),
			)
			.unwrap();
		let value = evaluation.await.unwrap().unwrap();
		assert_eq!(value, serde_json::json!(7));
	}
}
