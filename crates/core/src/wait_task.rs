//! Predicate polling inside a remote realm (`wait_for_function`).
//!
//! A [`WaitTask`] injects a poller into its world's execution context
//! and suspends on the poller's promise. When a navigation destroys
//! the context mid-poll the task is not failed; it lies dormant until
//! the world installs the next context and reruns it. Detached frames,
//! timeouts and aborts are terminal.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;

use cdp_runtime::{Error, Result};

use crate::isolated_world::IsolatedWorld;
use crate::util::{AbortSignal, Deferred};

/// How the poller re-checks the predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polling {
	/// Once per animation frame.
	Raf,
	/// On every DOM mutation.
	Mutation,
	/// On a fixed interval.
	Interval(Duration),
}

/// In-flight `wait_for_function` registration.
pub struct WaitTask {
	world: Weak<IsolatedWorld>,
	predicate: String,
	polling: Polling,
	result: Deferred<Value>,
}

impl WaitTask {
	/// Registers the task with the world and starts the first poll.
	pub fn new(world: &Arc<IsolatedWorld>, predicate: &str, polling: Polling) -> Arc<Self> {
		let task = Arc::new(Self {
			world: Arc::downgrade(world),
			predicate: predicate.to_string(),
			polling,
			result: Deferred::new(),
		});
		world.task_manager().add(Arc::clone(&task));
		tokio::spawn(Arc::clone(&task).rerun());
		task
	}

	/// Awaits the first truthy predicate result, bounded by the
	/// timeout and abort signal.
	pub async fn wait(
		self: &Arc<Self>,
		timeout: Option<Duration>,
		signal: Option<AbortSignal>,
	) -> Result<Value> {
		let outcome = tokio::select! {
			result = self.result.wait() => result,
			() = sleep_or_never(timeout) => Err(Error::Timeout(format!(
				"Waiting failed: {}ms exceeded",
				timeout.map(|t| t.as_millis()).unwrap_or_default()
			))),
			reason = abort_or_never(signal) => Err(Error::Aborted(reason)),
		};
		if outcome.is_err() {
			self.terminate(outcome.clone());
		}
		outcome
	}

	/// Runs one poll round. Called on creation and again by the world
	/// every time a context is installed.
	pub(crate) async fn rerun(self: Arc<Self>) {
		if self.result.is_settled() {
			return;
		}
		let Some(world) = self.world.upgrade() else {
			return;
		};
		let Ok(context) = world.execution_context().await else {
			// The context went away before we could poll; the next
			// installed context reruns us.
			return;
		};

		let expression = poller_expression(&self.predicate, self.polling);
		match context.evaluate(&expression).await {
			Ok(value) => self.terminate(Ok(value)),
			Err(error) => {
				let message = error.to_string();
				if message.contains("Execution context was destroyed")
					|| message.contains("Cannot find context with specified id")
				{
					// Superseded by a navigation; stay registered.
				} else if message.contains("detached frame") {
					self.terminate(Err(Error::Evaluation(
						"Waiting failed: Frame detached".to_string(),
					)));
				} else {
					self.terminate(Err(error));
				}
			}
		}
	}

	pub(crate) fn terminate(&self, outcome: Result<Value>) {
		match outcome {
			Ok(value) => self.result.resolve(value),
			Err(error) => self.result.reject(error),
		}
		if let Some(world) = self.world.upgrade() {
			world.task_manager().delete(self);
		}
	}

	pub(crate) fn fail(&self, error: Error) {
		self.result.reject(error);
	}
}

async fn sleep_or_never(timeout: Option<Duration>) {
	match timeout {
		Some(timeout) => tokio::time::sleep(timeout).await,
		None => std::future::pending().await,
	}
}

async fn abort_or_never(signal: Option<AbortSignal>) -> String {
	match signal {
		Some(signal) => signal.aborted().await,
		None => std::future::pending().await,
	}
}

fn poller_expression(predicate: &str, polling: Polling) -> String {
	match polling {
		Polling::Raf => format!(
			r#"(() => {{
	const predicate = ({predicate});
	return new Promise((resolve, reject) => {{
		const check = async () => {{
			try {{
				const result = await predicate();
				if (result) {{ resolve(result); return; }}
			}} catch (error) {{ reject(error); return; }}
			requestAnimationFrame(check);
		}};
		check();
	}});
}})()"#
		),
		Polling::Mutation => format!(
			r#"(() => {{
	const predicate = ({predicate});
	return new Promise((resolve, reject) => {{
		const observer = new MutationObserver(() => {{ void check(); }});
		const check = async () => {{
			try {{
				const result = await predicate();
				if (result) {{ observer.disconnect(); resolve(result); return; }}
			}} catch (error) {{ observer.disconnect(); reject(error); }}
		}};
		observer.observe(document, {{childList: true, subtree: true, attributes: true, characterData: true}});
		void check();
	}});
}})()"#
		),
		Polling::Interval(interval) => format!(
			r#"(() => {{
	const predicate = ({predicate});
	return new Promise((resolve, reject) => {{
		const timer = setInterval(async () => {{
			try {{
				const result = await predicate();
				if (result) {{ clearInterval(timer); resolve(result); }}
			}} catch (error) {{ clearInterval(timer); reject(error); }}
		}}, {});
	}});
}})()"#,
			interval.as_millis()
		),
	}
}

/// Registry of live wait tasks for one world.
#[derive(Default)]
pub struct TaskManager {
	tasks: Mutex<Vec<Arc<WaitTask>>>,
}

impl TaskManager {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&self, task: Arc<WaitTask>) {
		self.tasks.lock().push(task);
	}

	pub fn delete(&self, task: &WaitTask) {
		self.tasks
			.lock()
			.retain(|candidate| !std::ptr::eq(candidate.as_ref(), task));
	}

	/// Fails every registered task, e.g. when the frame detaches.
	pub fn terminate_all(&self, error: Error) {
		let tasks: Vec<Arc<WaitTask>> = self.tasks.lock().drain(..).collect();
		for task in tasks {
			task.fail(error.clone());
		}
	}

	/// Restarts every registered task against the world's new context.
	pub fn rerun_all(&self) {
		let tasks: Vec<Arc<WaitTask>> = self.tasks.lock().clone();
		for task in tasks {
			tokio::spawn(task.rerun());
		}
	}

	pub fn len(&self) -> usize {
		self.tasks.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.tasks.lock().is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::execution_context::ExecutionContext;
	use crate::isolated_world::WorldKind;
	use crate::test_util::attached_session;
	use crate::util::AbortController;

	fn reply(id: u64, result: Value) -> String {
		serde_json::json!({"sessionId": "S1", "id": id, "result": result}).to_string()
	}

	fn reply_error(id: u64, message: &str) -> String {
		serde_json::json!({
			"sessionId": "S1", "id": id,
			"error": {"code": -32000, "message": message},
		})
		.to_string()
	}

	#[tokio::test]
	async fn resolves_with_the_poller_result() {
		let (_connection, session, mut handle) = attached_session().await;
		let world = IsolatedWorld::new(WorldKind::Main);
		world.set_context(ExecutionContext::new(1, Arc::clone(&session)));

		let task = WaitTask::new(&world, "() => document.title !== ''", Polling::Raf);

		let frame = handle.outgoing.recv().await.unwrap();
		let sent: Value = serde_json::from_str(&frame).unwrap();
		assert_eq!(sent["method"], "Runtime.evaluate");
		assert!(sent["params"]["expression"]
			.as_str()
			.unwrap()
			.contains("document.title"));
		let id = sent["id"].as_u64().unwrap();
		handle
			.incoming
			.send(reply(id, serde_json::json!({"result": {"type": "string", "value": "ready"}})))
			.unwrap();

		let value = task.wait(Some(Duration::from_secs(1)), None).await.unwrap();
		assert_eq!(value, "ready");
		assert!(world.task_manager().is_empty());
	}

	#[tokio::test]
	async fn context_destroyed_mid_poll_retries_on_next_context() {
		let (_connection, session, mut handle) = attached_session().await;
		let world = IsolatedWorld::new(WorldKind::Main);
		world.set_context(ExecutionContext::new(1, Arc::clone(&session)));

		let task = WaitTask::new(&world, "() => window.__done", Polling::Mutation);

		// First poll dies with the navigation race.
		let frame = handle.outgoing.recv().await.unwrap();
		let sent: Value = serde_json::from_str(&frame).unwrap();
		handle
			.incoming
			.send(reply_error(
				sent["id"].as_u64().unwrap(),
				"Execution context was destroyed",
			))
			.unwrap();
		tokio::task::yield_now().await;
		assert_eq!(world.task_manager().len(), 1);

		// The next document's context reruns the task.
		world.clear_context();
		world.set_context(ExecutionContext::new(2, Arc::clone(&session)));
		let frame = handle.outgoing.recv().await.unwrap();
		let sent: Value = serde_json::from_str(&frame).unwrap();
		assert_eq!(sent["params"]["contextId"], 2);
		handle
			.incoming
			.send(reply(
				sent["id"].as_u64().unwrap(),
				serde_json::json!({"result": {"type": "boolean", "value": true}}),
			))
			.unwrap();

		let value = task.wait(Some(Duration::from_secs(1)), None).await.unwrap();
		assert_eq!(value, true);
	}

	#[tokio::test]
	async fn detached_frame_error_is_terminal() {
		let (_connection, session, mut handle) = attached_session().await;
		let world = IsolatedWorld::new(WorldKind::Main);
		world.set_context(ExecutionContext::new(1, Arc::clone(&session)));

		let task = WaitTask::new(&world, "() => true", Polling::Raf);
		let frame = handle.outgoing.recv().await.unwrap();
		let sent: Value = serde_json::from_str(&frame).unwrap();
		handle
			.incoming
			.send(reply_error(
				sent["id"].as_u64().unwrap(),
				"Execution context is not available in detached frame",
			))
			.unwrap();

		let err = task.wait(Some(Duration::from_secs(1)), None).await.unwrap_err();
		assert_eq!(err.to_string(), "Evaluation failed: Waiting failed: Frame detached");
	}

	#[tokio::test]
	async fn times_out_when_the_predicate_never_passes() {
		let (_connection, session, _handle) = attached_session().await;
		let world = IsolatedWorld::new(WorldKind::Main);
		world.set_context(ExecutionContext::new(1, session));

		let task = WaitTask::new(&world, "() => false", Polling::Raf);
		let err = task
			.wait(Some(Duration::from_millis(50)), None)
			.await
			.unwrap_err();
		assert!(err.is_timeout());
		assert!(err.to_string().contains("50ms exceeded"), "{err}");
	}

	#[tokio::test]
	async fn abort_beats_the_timeout() {
		let (_connection, session, _handle) = attached_session().await;
		let world = IsolatedWorld::new(WorldKind::Main);
		world.set_context(ExecutionContext::new(1, session));

		let controller = AbortController::new();
		let task = WaitTask::new(&world, "() => false", Polling::Raf);
		let wait = tokio::spawn({
			let task = Arc::clone(&task);
			let signal = controller.signal();
			async move { task.wait(Some(Duration::from_secs(30)), Some(signal)).await }
		});
		tokio::task::yield_now().await;
		controller.abort("caller went away");

		let err = wait.await.unwrap().unwrap_err();
		assert!(err.is_aborted());
		assert!(err.to_string().contains("caller went away"));
	}
}
