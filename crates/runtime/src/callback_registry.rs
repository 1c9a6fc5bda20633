//! Pending-command registry correlating request IDs to awaiting callers.
//!
//! Every outbound command registers a oneshot slot keyed by its request
//! ID. The slot is removed on exactly one of: a matching response, an
//! explicit rejection, a registry-wide clear (disconnect), or the
//! caller dropping its future (RAII cancel guard).

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

use crate::error::{Error, Result};

struct Callback {
	tx: oneshot::Sender<Result<Value>>,
	method: String,
}

type PendingMap = Arc<Mutex<HashMap<u64, Callback>>>;

/// Maps outstanding request IDs to pending result slots.
///
/// IDs are assigned by the owning connection and are monotonically
/// increasing; an ID is never reused while its entry is pending.
#[derive(Default)]
pub struct CallbackRegistry {
	pending: PendingMap,
}

impl CallbackRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a pending slot for `id` and returns the future that
	/// resolves with the correlated response.
	pub fn create(&self, id: u64, method: &str) -> ResponseFuture {
		let (tx, rx) = oneshot::channel();
		self.pending.lock().insert(
			id,
			Callback {
				tx,
				method: method.to_string(),
			},
		);
		ResponseFuture {
			rx,
			guard: CancelGuard {
				id,
				pending: Arc::clone(&self.pending),
				completed: false,
			},
		}
	}

	/// Resolves the pending slot for `id`. Returns false when no slot
	/// was pending (late or duplicate response).
	pub fn resolve(&self, id: u64, result: Value) -> bool {
		match self.pending.lock().remove(&id) {
			Some(callback) => {
				let _ = callback.tx.send(Ok(result));
				true
			}
			None => false,
		}
	}

	/// Rejects the pending slot for `id` with `error`.
	pub fn reject(&self, id: u64, error: Error) -> bool {
		match self.pending.lock().remove(&id) {
			Some(callback) => {
				let _ = callback.tx.send(Err(error));
				true
			}
			None => false,
		}
	}

	/// Rejects the pending slot for `id` with the peer's error payload,
	/// preserving the original method name for diagnostics.
	pub fn reject_payload(&self, id: u64, payload: &cdp_protocol::ErrorPayload) -> bool {
		let mut message = payload.message.clone();
		if let Some(data) = &payload.data {
			message.push(' ');
			message.push_str(data);
		}
		match self.pending.lock().remove(&id) {
			Some(callback) => {
				let error = Error::Protocol {
					method: callback.method,
					message,
				};
				let _ = callback.tx.send(Err(error));
				true
			}
			None => false,
		}
	}

	/// Bulk-fails every pending slot, e.g. on disconnect. The error is
	/// built per-slot so it can name the in-flight method.
	pub fn clear(&self, make_error: impl Fn(&str) -> Error) {
		let callbacks: Vec<Callback> = {
			let mut pending = self.pending.lock();
			pending.drain().map(|(_, cb)| cb).collect()
		};
		for callback in callbacks {
			let error = make_error(&callback.method);
			let _ = callback.tx.send(Err(error));
		}
	}

	/// Number of in-flight commands.
	pub fn pending_count(&self) -> usize {
		self.pending.lock().len()
	}
}

/// RAII guard removing an orphaned slot when a caller drops its future.
struct CancelGuard {
	id: u64,
	pending: PendingMap,
	completed: bool,
}

impl Drop for CancelGuard {
	fn drop(&mut self) {
		if !self.completed {
			if self.pending.lock().remove(&self.id).is_some() {
				tracing::debug!(id = self.id, "removed orphaned callback");
			}
		}
	}
}

/// Future resolving with the response correlated to one request ID.
pub struct ResponseFuture {
	rx: oneshot::Receiver<Result<Value>>,
	guard: CancelGuard,
}

impl Future for ResponseFuture {
	type Output = Result<Value>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.rx).poll(cx) {
			Poll::Ready(result) => {
				self.guard.completed = true;
				Poll::Ready(result.map_err(|_| Error::ChannelClosed).and_then(|r| r))
			}
			Poll::Pending => Poll::Pending,
		}
	}
}
