//! Small async primitives shared across the crate.

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use cdp_runtime::{Error, Result};

enum DeferredState<T> {
	Pending,
	Resolved(T),
	Rejected(Error),
}

/// A one-shot value that many tasks can await.
///
/// The first `resolve`/`reject` wins; later settlements are ignored.
/// Waiters that subscribe after settlement observe the stored outcome
/// immediately.
pub struct Deferred<T: Clone> {
	state: Mutex<DeferredState<T>>,
	notify: Notify,
}

impl<T: Clone> Deferred<T> {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(DeferredState::Pending),
			notify: Notify::new(),
		}
	}

	pub fn resolve(&self, value: T) {
		let mut state = self.state.lock();
		if matches!(*state, DeferredState::Pending) {
			*state = DeferredState::Resolved(value);
			drop(state);
			self.notify.notify_waiters();
		}
	}

	pub fn reject(&self, error: Error) {
		let mut state = self.state.lock();
		if matches!(*state, DeferredState::Pending) {
			*state = DeferredState::Rejected(error);
			drop(state);
			self.notify.notify_waiters();
		}
	}

	pub fn is_settled(&self) -> bool {
		!matches!(*self.state.lock(), DeferredState::Pending)
	}

	/// The settled outcome, if any.
	pub fn peek(&self) -> Option<Result<T>> {
		match &*self.state.lock() {
			DeferredState::Pending => None,
			DeferredState::Resolved(value) => Some(Ok(value.clone())),
			DeferredState::Rejected(error) => Some(Err(error.clone())),
		}
	}

	/// Waits until the deferred settles.
	pub async fn wait(&self) -> Result<T> {
		loop {
			// Register for notification before checking, otherwise a
			// settlement between check and await would be missed.
			let notified = self.notify.notified();
			if let Some(outcome) = self.peek() {
				return outcome;
			}
			notified.await;
		}
	}
}

impl<T: Clone> Default for Deferred<T> {
	fn default() -> Self {
		Self::new()
	}
}

/// Cancellation source paired with any number of [`AbortSignal`]s.
pub struct AbortController {
	tx: watch::Sender<Option<String>>,
}

impl AbortController {
	pub fn new() -> Self {
		let (tx, _) = watch::channel(None);
		Self { tx }
	}

	pub fn signal(&self) -> AbortSignal {
		AbortSignal {
			rx: self.tx.subscribe(),
		}
	}

	/// Aborts every associated signal with the given reason.
	pub fn abort(&self, reason: &str) {
		self.tx.send_replace(Some(reason.to_string()));
	}
}

impl Default for AbortController {
	fn default() -> Self {
		Self::new()
	}
}

/// Observer half of an [`AbortController`].
#[derive(Clone)]
pub struct AbortSignal {
	rx: watch::Receiver<Option<String>>,
}

impl AbortSignal {
	pub fn is_aborted(&self) -> bool {
		self.rx.borrow().is_some()
	}

	pub fn reason(&self) -> Option<String> {
		self.rx.borrow().clone()
	}

	/// Resolves with the abort reason. Never resolves if the
	/// controller goes away without aborting.
	pub async fn aborted(&self) -> String {
		let mut rx = self.rx.clone();
		loop {
			if let Some(reason) = rx.borrow_and_update().clone() {
				return reason;
			}
			if rx.changed().await.is_err() {
				std::future::pending::<()>().await;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;

	#[tokio::test]
	async fn deferred_fans_out_to_every_waiter() {
		let deferred: Arc<Deferred<u32>> = Arc::new(Deferred::new());
		let a = tokio::spawn({
			let deferred = Arc::clone(&deferred);
			async move { deferred.wait().await }
		});
		let b = tokio::spawn({
			let deferred = Arc::clone(&deferred);
			async move { deferred.wait().await }
		});
		tokio::task::yield_now().await;
		deferred.resolve(7);
		assert_eq!(a.await.unwrap().unwrap(), 7);
		assert_eq!(b.await.unwrap().unwrap(), 7);
	}

	#[tokio::test]
	async fn deferred_first_settlement_wins() {
		let deferred: Deferred<u32> = Deferred::new();
		deferred.resolve(1);
		deferred.reject(Error::ChannelClosed);
		deferred.resolve(2);
		assert_eq!(deferred.wait().await.unwrap(), 1);
	}

	#[tokio::test]
	async fn late_waiters_observe_rejection() {
		let deferred: Deferred<()> = Deferred::new();
		deferred.reject(Error::Aborted("gone".into()));
		assert!(deferred.wait().await.unwrap_err().is_aborted());
	}

	#[tokio::test]
	async fn abort_signal_fires_for_all_clones() {
		let controller = AbortController::new();
		let signal = controller.signal();
		let clone = signal.clone();
		assert!(!signal.is_aborted());

		controller.abort("test teardown");

		assert!(signal.is_aborted());
		assert_eq!(clone.aborted().await, "test teardown");
	}
}
