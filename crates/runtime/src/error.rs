//! Error types for the DevTools runtime.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a browser over the protocol.
///
/// The enum is `Clone` so that a single failure can be fanned out to
/// every waiter of a deferred value; `Io`/`Json` therefore carry their
/// source rendered to a string.
#[derive(Debug, Clone, Error)]
pub enum Error {
	/// Failed to establish a connection with the browser.
	#[error("Failed to connect to browser: {0}")]
	ConnectionFailed(String),

	/// Transport-level error (WebSocket or pipe communication).
	#[error("Transport error: {0}")]
	Transport(String),

	/// The browser replied to a command with an explicit error.
	#[error("Protocol error ({method}): {message}")]
	Protocol { method: String, message: String },

	/// A script evaluated in the browser threw.
	#[error("Evaluation failed: {0}")]
	Evaluation(String),

	/// The connection closed before an operation completed.
	#[error("Connection closed: {0}")]
	ConnectionClosed(String),

	/// Internal channel closed unexpectedly.
	#[error("Channel closed unexpectedly")]
	ChannelClosed,

	/// Timeout waiting for an operation.
	#[error("Timeout: {0}")]
	Timeout(String),

	/// Navigation deadline elapsed.
	#[error("Navigation timeout of {duration_ms} ms exceeded navigating to '{url}'")]
	NavigationTimeout { url: String, duration_ms: u64 },

	/// The target (browser, page or worker) went away mid-operation.
	#[error("Target closed ({target_type}): {context}")]
	TargetClosed {
		target_type: String,
		context: String,
	},

	/// A wait was cancelled through its abort signal.
	#[error("Aborted: {0}")]
	Aborted(String),

	/// I/O error.
	#[error("I/O error: {0}")]
	Io(String),

	/// JSON serialization/deserialization error.
	#[error("JSON error: {0}")]
	Json(String),

	/// Invalid argument provided to a method.
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Error::Io(err.to_string())
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Error::Json(err.to_string())
	}
}

impl Error {
	/// Returns true if this is a timeout error.
	pub fn is_timeout(&self) -> bool {
		matches!(
			self,
			Error::Timeout(_) | Error::NavigationTimeout { .. }
		)
	}

	/// Returns true if this is a target closed or disconnect error.
	pub fn is_target_closed(&self) -> bool {
		matches!(
			self,
			Error::TargetClosed { .. } | Error::ConnectionClosed(_)
		)
	}

	/// Returns true if this wait was cancelled via an abort signal.
	pub fn is_aborted(&self) -> bool {
		matches!(self, Error::Aborted(_))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn timeout_predicates() {
		assert!(Error::Timeout("waiting".into()).is_timeout());
		assert!(
			Error::NavigationTimeout {
				url: "about:blank".into(),
				duration_ms: 30_000,
			}
			.is_timeout()
		);
		assert!(!Error::ChannelClosed.is_timeout());
	}

	#[test]
	fn navigation_timeout_reports_configured_duration() {
		let err = Error::NavigationTimeout {
			url: "https://example.com".into(),
			duration_ms: 5_000,
		};
		let message = err.to_string();
		assert!(message.contains("5000 ms"), "{message}");
		assert!(message.contains("https://example.com"), "{message}");
	}

	#[test]
	fn aborted_is_distinguishable_from_timeout() {
		let err = Error::Aborted("caller cancelled".into());
		assert!(err.is_aborted());
		assert!(!err.is_timeout());
	}
}
