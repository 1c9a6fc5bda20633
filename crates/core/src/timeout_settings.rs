//! Configurable default deadlines for waits and navigations.

use parking_lot::Mutex;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared per-page timeout configuration.
///
/// A navigation-specific override takes precedence over the general
/// override, which takes precedence over the built-in 30 s default.
#[derive(Default)]
pub struct TimeoutSettings {
	default_timeout: Mutex<Option<Duration>>,
	default_navigation_timeout: Mutex<Option<Duration>>,
}

impl TimeoutSettings {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_default_timeout(&self, timeout: Duration) {
		*self.default_timeout.lock() = Some(timeout);
	}

	pub fn set_default_navigation_timeout(&self, timeout: Duration) {
		*self.default_navigation_timeout.lock() = Some(timeout);
	}

	pub fn timeout(&self) -> Duration {
		self.default_timeout.lock().unwrap_or(DEFAULT_TIMEOUT)
	}

	pub fn navigation_timeout(&self) -> Duration {
		if let Some(timeout) = *self.default_navigation_timeout.lock() {
			return timeout;
		}
		self.timeout()
	}
}
