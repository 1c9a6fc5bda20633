//! Per-frame JavaScript worlds and their execution-context lifecycle.
//!
//! Each frame has two worlds: the page's main world and a utility
//! world for the client's own scripts. A world's execution context
//! comes and goes with navigations; callers awaiting a context while
//! none exists are parked until the browser announces the next one.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cdp_runtime::{Error, Result};

use crate::execution_context::{ExecutionContext, RemoteHandle};
use crate::util::Deferred;
use crate::wait_task::TaskManager;

/// Name under which the client's isolated worlds are created.
pub const UTILITY_WORLD_NAME: &str = "__cdp_utility_world__";

const CONTEXT_DESTROYED: &str =
	"Execution context was destroyed, most likely because of a navigation";

/// Which of a frame's two worlds a context belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldKind {
	Main,
	Utility,
}

pub struct IsolatedWorld {
	kind: WorldKind,
	context: Mutex<Arc<Deferred<ExecutionContext>>>,
	tasks: TaskManager,
	disposed: AtomicBool,
}

impl IsolatedWorld {
	pub fn new(kind: WorldKind) -> Arc<Self> {
		Arc::new(Self {
			kind,
			context: Mutex::new(Arc::new(Deferred::new())),
			tasks: TaskManager::new(),
			disposed: AtomicBool::new(false),
		})
	}

	pub fn kind(&self) -> WorldKind {
		self.kind
	}

	pub fn task_manager(&self) -> &TaskManager {
		&self.tasks
	}

	pub fn is_disposed(&self) -> bool {
		self.disposed.load(Ordering::SeqCst)
	}

	/// The current context if one is installed right now.
	pub fn context(&self) -> Option<ExecutionContext> {
		self.context.lock().peek().and_then(|r| r.ok())
	}

	/// Installs a fresh context and reruns every registered wait task.
	pub fn set_context(self: &Arc<Self>, context: ExecutionContext) {
		{
			let mut slot = self.context.lock();
			if slot.is_settled() {
				*slot = Arc::new(Deferred::new());
			}
			slot.resolve(context);
		}
		self.tasks.rerun_all();
	}

	/// Drops the current context. Anyone already awaiting it is failed
	/// with a context-destroyed error; the world re-arms for the next
	/// [`IsolatedWorld::set_context`].
	pub fn clear_context(&self) {
		let old = {
			let mut slot = self.context.lock();
			std::mem::replace(&mut *slot, Arc::new(Deferred::new()))
		};
		old.reject(Error::Evaluation(CONTEXT_DESTROYED.to_string()));
	}

	/// Waits for a context to be installed.
	pub async fn execution_context(&self) -> Result<ExecutionContext> {
		if self.is_disposed() {
			return Err(Error::Evaluation(
				"Attempted to use a disposed world, the frame has likely been detached".to_string(),
			));
		}
		let deferred = Arc::clone(&*self.context.lock());
		deferred.wait().await
	}

	pub async fn evaluate(&self, expression: &str) -> Result<Value> {
		let context = self.execution_context().await?;
		context.evaluate(expression).await
	}

	pub async fn call_function(&self, declaration: &str, args: Vec<Value>) -> Result<Value> {
		let context = self.execution_context().await?;
		context.call_function(declaration, args).await
	}

	pub async fn evaluate_handle(&self, expression: &str) -> Result<RemoteHandle> {
		let context = self.execution_context().await?;
		context.evaluate_handle(expression).await
	}

	/// Tears the world down when its frame detaches: pending context
	/// waiters and wait tasks are all failed. Idempotent.
	pub fn dispose(&self, reason: Error) {
		if self.disposed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.context.lock().reject(reason.clone());
		self.tasks.terminate_all(reason);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn waiters_park_until_a_context_arrives() {
		let world = IsolatedWorld::new(WorldKind::Main);
		assert!(world.context().is_none());

		let waiter = tokio::spawn({
			let world = Arc::clone(&world);
			async move { world.execution_context().await }
		});
		tokio::task::yield_now().await;

		world.clear_context();
		let err = waiter.await.unwrap().unwrap_err();
		assert!(err.to_string().contains("Execution context was destroyed"), "{err}");

		// The world re-armed: a fresh waiter parks again.
		let world2 = Arc::clone(&world);
		let parked = tokio::spawn(async move { world2.execution_context().await });
		tokio::task::yield_now().await;
		assert!(!parked.is_finished());
		parked.abort();
	}

	#[tokio::test]
	async fn dispose_rejects_context_waiters() {
		let world = IsolatedWorld::new(WorldKind::Utility);
		let waiter = tokio::spawn({
			let world = Arc::clone(&world);
			async move { world.execution_context().await }
		});
		tokio::task::yield_now().await;

		world.dispose(Error::Evaluation("waitForFunction failed: frame got detached".into()));
		assert!(waiter.await.unwrap().is_err());
		assert!(world.is_disposed());

		// Disposal is sticky.
		assert!(world.execution_context().await.is_err());
	}
}
