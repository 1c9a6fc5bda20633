//! One debuggable target and its lazily-built page/worker surface.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use cdp_protocol::target::TargetInfo;
use cdp_runtime::{CdpSession, Connection, Error, Result};

use crate::page::Page;
use crate::util::Deferred;
use crate::worker::WebWorker;

/// The closed set of target types the protocol reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
	Page,
	BackgroundPage,
	ServiceWorker,
	SharedWorker,
	Browser,
	Webview,
	Tab,
	Other,
}

impl TargetKind {
	pub fn parse(kind: &str) -> Self {
		match kind {
			"page" => TargetKind::Page,
			"background_page" => TargetKind::BackgroundPage,
			"service_worker" => TargetKind::ServiceWorker,
			"shared_worker" => TargetKind::SharedWorker,
			"browser" => TargetKind::Browser,
			"webview" => TargetKind::Webview,
			"tab" => TargetKind::Tab,
			_ => TargetKind::Other,
		}
	}

	pub fn supports_page(self) -> bool {
		matches!(
			self,
			TargetKind::Page | TargetKind::BackgroundPage | TargetKind::Webview
		)
	}

	pub fn supports_worker(self) -> bool {
		matches!(self, TargetKind::ServiceWorker | TargetKind::SharedWorker)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializationStatus {
	Success,
	Aborted,
}

/// A discovered target. Its [`TargetInfo`] is updated in place as
/// `Target.targetInfoChanged` events arrive.
pub struct Target {
	connection: Weak<Connection>,
	info: Mutex<TargetInfo>,
	session_id: Mutex<Option<Arc<str>>>,
	initialized: Deferred<InitializationStatus>,
	page: tokio::sync::Mutex<Option<Arc<Page>>>,
	worker: tokio::sync::Mutex<Option<Arc<WebWorker>>>,
}

impl Target {
	pub(crate) fn new(info: TargetInfo, connection: Weak<Connection>) -> Arc<Self> {
		Arc::new(Self {
			connection,
			info: Mutex::new(info),
			session_id: Mutex::new(None),
			initialized: Deferred::new(),
			page: tokio::sync::Mutex::new(None),
			worker: tokio::sync::Mutex::new(None),
		})
	}

	pub fn id(&self) -> String {
		self.info.lock().target_id.clone()
	}

	pub fn kind(&self) -> TargetKind {
		TargetKind::parse(&self.info.lock().kind)
	}

	pub fn url(&self) -> String {
		self.info.lock().url.clone()
	}

	pub fn opener_id(&self) -> Option<String> {
		self.info.lock().opener_id.clone()
	}

	pub fn browser_context_id(&self) -> Option<String> {
		self.info.lock().browser_context_id.clone()
	}

	pub fn info(&self) -> TargetInfo {
		self.info.lock().clone()
	}

	/// The session auto-attach (or a manual attach) bound to this
	/// target, when one exists.
	pub fn session(&self) -> Option<Arc<CdpSession>> {
		let session_id = self.session_id.lock().clone()?;
		self.connection.upgrade()?.session(&session_id)
	}

	/// Attaches a fresh session to this target.
	pub async fn create_session(&self) -> Result<Arc<CdpSession>> {
		let connection = self
			.connection
			.upgrade()
			.ok_or_else(|| Error::ConnectionClosed("connection is disposed".to_string()))?;
		connection.create_session(&self.id()).await
	}

	/// Resolves once the target is usable, or reports that it was
	/// destroyed or filtered away first.
	pub async fn initialized(&self) -> Result<InitializationStatus> {
		self.initialized.wait().await
	}

	pub fn is_initialized(&self) -> bool {
		matches!(
			self.initialized.peek(),
			Some(Ok(InitializationStatus::Success))
		)
	}

	/// The page surface for page-like targets, built on first use.
	pub async fn page(&self) -> Result<Option<Arc<Page>>> {
		if !self.kind().supports_page() {
			return Ok(None);
		}
		let mut slot = self.page.lock().await;
		if let Some(page) = slot.as_ref() {
			return Ok(Some(Arc::clone(page)));
		}
		let connection = self
			.connection
			.upgrade()
			.ok_or_else(|| Error::ConnectionClosed("connection is disposed".to_string()))?;
		let session = match self.session() {
			Some(session) => session,
			None => connection.create_session(&self.id()).await?,
		};
		let page = Page::new(&connection, session, &self.id()).await?;
		*slot = Some(Arc::clone(&page));
		Ok(Some(page))
	}

	/// The worker surface for worker targets, built on first use.
	pub async fn worker(&self) -> Result<Option<Arc<WebWorker>>> {
		if !self.kind().supports_worker() {
			return Ok(None);
		}
		let mut slot = self.worker.lock().await;
		if let Some(worker) = slot.as_ref() {
			return Ok(Some(Arc::clone(worker)));
		}
		let connection = self
			.connection
			.upgrade()
			.ok_or_else(|| Error::ConnectionClosed("connection is disposed".to_string()))?;
		let session = match self.session() {
			Some(session) => session,
			None => connection.create_session(&self.id()).await?,
		};
		let worker = WebWorker::new(session, &self.url());
		worker.initialize().await?;
		*slot = Some(Arc::clone(&worker));
		Ok(Some(worker))
	}

	/// The target that opened this one (window.open), when known.
	pub fn opener(&self, lookup: impl Fn(&str) -> Option<Arc<Target>>) -> Option<Arc<Target>> {
		let opener_id = self.opener_id()?;
		lookup(&opener_id)
	}

	pub(crate) fn set_session_id(&self, session_id: Arc<str>) {
		*self.session_id.lock() = Some(session_id);
	}

	pub(crate) fn info_changed(&self, info: TargetInfo) {
		*self.info.lock() = info;
	}

	/// Marks the target usable. Pages only count once a URL has
	/// committed; a just-created page target reports an empty URL.
	/// Returns true the first time the target becomes initialized.
	pub(crate) fn maybe_initialize(&self) -> bool {
		if self.initialized.is_settled() {
			return false;
		}
		if self.kind() == TargetKind::Page && self.url().is_empty() {
			return false;
		}
		self.initialized.resolve(InitializationStatus::Success);
		true
	}

	pub(crate) fn abort_initialization(&self) {
		self.initialized.resolve(InitializationStatus::Aborted);
	}

	pub(crate) async fn cached_page(&self) -> Option<Arc<Page>> {
		self.page.lock().await.clone()
	}
}

impl std::fmt::Debug for Target {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let info = self.info.lock();
		f.debug_struct("Target")
			.field("id", &info.target_id)
			.field("kind", &info.kind)
			.field("url", &info.url)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn info(kind: &str, url: &str) -> TargetInfo {
		serde_json::from_value(serde_json::json!({
			"targetId": "T1",
			"type": kind,
			"title": "",
			"url": url,
			"attached": false,
		}))
		.unwrap()
	}

	#[tokio::test]
	async fn page_targets_wait_for_a_committed_url() {
		let target = Target::new(info("page", ""), Weak::new());
		assert!(!target.maybe_initialize());
		assert!(!target.is_initialized());

		target.info_changed(info("page", "http://a.test/"));
		assert!(target.maybe_initialize());
		assert!(target.is_initialized());
		// Already settled; must not report a second initialization.
		assert!(!target.maybe_initialize());
		assert_eq!(
			target.initialized().await.unwrap(),
			InitializationStatus::Success
		);
	}

	#[tokio::test]
	async fn non_page_targets_initialize_immediately() {
		let target = Target::new(info("service_worker", ""), Weak::new());
		assert!(target.maybe_initialize());
	}

	#[tokio::test]
	async fn aborted_initialization_is_observable() {
		let target = Target::new(info("page", ""), Weak::new());
		target.abort_initialization();
		assert_eq!(
			target.initialized().await.unwrap(),
			InitializationStatus::Aborted
		);
		assert!(!target.is_initialized());
	}
}
