//! Internal event bus used by the connection, sessions and managers.
//!
//! Combines a broadcast channel with predicate-based one-shot waiters.
//! Buses are owned privately by the objects that emit on them and are
//! never part of the public API surface; consumers only ever see
//! `broadcast::Receiver` subscriptions.
//!
//! Waiters are checked first during [`EventBus::emit`], ensuring
//! guaranteed delivery for `wait_for_*` patterns even when broadcast
//! receivers are lagging.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

use crate::error::{Error, Result};

struct WaiterEntry<E> {
	predicate: Box<dyn Fn(&E) -> bool + Send + Sync>,
	complete_tx: oneshot::Sender<E>,
}

pub struct EventBus<E: Clone + Send + 'static> {
	tx: broadcast::Sender<E>,
	waiters: Mutex<Vec<WaiterEntry<E>>>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
	/// Creates a new bus with the specified broadcast channel capacity.
	pub fn new(capacity: usize) -> Self {
		let (tx, _) = broadcast::channel(capacity);
		Self {
			tx,
			waiters: Mutex::new(Vec::new()),
		}
	}

	/// Emits an event to all matching waiters, then all subscribers.
	pub fn emit(&self, event: E) {
		let mut waiters = self.waiters.lock();
		let mut index = 0;
		while index < waiters.len() {
			if (waiters[index].predicate)(&event) {
				let entry = waiters.swap_remove(index);
				let _ = entry.complete_tx.send(event.clone());
			} else {
				index += 1;
			}
		}
		drop(waiters);

		// A send error only means there are no active subscribers.
		let _ = self.tx.send(event);
	}

	/// Subscribes to all future events.
	pub fn subscribe(&self) -> broadcast::Receiver<E> {
		self.tx.subscribe()
	}

	/// Registers a one-shot waiter resolved by the first event matching
	/// the predicate.
	pub fn register_waiter(
		&self,
		predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
	) -> oneshot::Receiver<E> {
		let (complete_tx, complete_rx) = oneshot::channel();
		self.waiters.lock().push(WaiterEntry {
			predicate: Box::new(predicate),
			complete_tx,
		});
		complete_rx
	}

	/// Waits for the first event matching `predicate`, up to `timeout`.
	pub async fn wait_for(
		&self,
		timeout: Duration,
		predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
	) -> Result<E> {
		let rx = self.register_waiter(predicate);
		match tokio::time::timeout(timeout, rx).await {
			Ok(Ok(event)) => Ok(event),
			Ok(Err(_)) => Err(Error::ChannelClosed),
			Err(_) => Err(Error::Timeout(format!(
				"waiting for event failed: {} ms exceeded",
				timeout.as_millis()
			))),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn waiters_receive_matching_events_before_subscribers() {
		let bus: EventBus<u32> = EventBus::new(8);
		let waiter = bus.register_waiter(|value| *value > 10);

		bus.emit(3);
		bus.emit(42);

		assert_eq!(waiter.await.unwrap(), 42);
	}

	#[tokio::test]
	async fn wait_for_times_out() {
		let bus: EventBus<u32> = EventBus::new(8);
		let err = bus
			.wait_for(Duration::from_millis(20), |_| true)
			.await
			.unwrap_err();
		assert!(err.is_timeout());
	}

	#[tokio::test]
	async fn subscribers_observe_all_events() {
		let bus: EventBus<&'static str> = EventBus::new(8);
		let mut rx = bus.subscribe();
		bus.emit("a");
		bus.emit("b");
		assert_eq!(rx.recv().await.unwrap(), "a");
		assert_eq!(rx.recv().await.unwrap(), "b");
	}
}
