//! One observed network request.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cdp_protocol::fetch::{ContinueRequestParams, FailRequestParams};
use cdp_protocol::network::RequestWillBeSentEvent;
use cdp_runtime::{CdpSession, Error, Result};

use super::response::HttpResponse;

/// Requests that redirect share one chain; each hop is appended as it
/// is superseded.
pub(crate) type RedirectChain = Arc<Mutex<Vec<Arc<HttpRequest>>>>;

pub struct HttpRequest {
	session: Arc<CdpSession>,
	id: String,
	/// Fetch-domain ID, set when interception paused this request.
	interception_id: Option<String>,
	frame_id: Option<String>,
	loader_id: String,
	url: String,
	method: String,
	headers: Mutex<HashMap<String, String>>,
	post_data: Option<String>,
	resource_type: Option<String>,
	is_navigation_request: bool,
	from_memory_cache: AtomicBool,
	failure_text: Mutex<Option<String>>,
	response: Mutex<Option<Arc<HttpResponse>>>,
	redirect_chain: RedirectChain,
	handled: AtomicBool,
}

impl HttpRequest {
	pub(crate) fn new(
		session: Arc<CdpSession>,
		event: &RequestWillBeSentEvent,
		interception_id: Option<String>,
		redirect_chain: RedirectChain,
	) -> Arc<Self> {
		// The main-document request reuses its loader's ID.
		let is_navigation_request = event.request_id == event.loader_id
			&& event.resource_type.as_deref() == Some("Document");
		Arc::new(Self {
			session,
			id: event.request_id.clone(),
			interception_id,
			frame_id: event.frame_id.clone(),
			loader_id: event.loader_id.clone(),
			url: event.request.url.clone(),
			method: event.request.method.clone(),
			headers: Mutex::new(event.request.headers.clone()),
			post_data: event.request.post_data.clone(),
			resource_type: event.resource_type.clone(),
			is_navigation_request,
			from_memory_cache: AtomicBool::new(false),
			failure_text: Mutex::new(None),
			response: Mutex::new(None),
			redirect_chain,
			handled: AtomicBool::new(false),
		})
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn url(&self) -> &str {
		&self.url
	}

	pub fn method(&self) -> &str {
		&self.method
	}

	pub fn headers(&self) -> HashMap<String, String> {
		self.headers.lock().clone()
	}

	pub fn post_data(&self) -> Option<&str> {
		self.post_data.as_deref()
	}

	pub fn resource_type(&self) -> Option<&str> {
		self.resource_type.as_deref()
	}

	pub fn frame_id(&self) -> Option<&str> {
		self.frame_id.as_deref()
	}

	pub fn loader_id(&self) -> &str {
		&self.loader_id
	}

	pub fn is_navigation_request(&self) -> bool {
		self.is_navigation_request
	}

	pub fn from_memory_cache(&self) -> bool {
		self.from_memory_cache.load(Ordering::SeqCst)
	}

	/// The error text reported by `Network.loadingFailed`, if any.
	pub fn failure(&self) -> Option<String> {
		self.failure_text.lock().clone()
	}

	pub fn response(&self) -> Option<Arc<HttpResponse>> {
		self.response.lock().clone()
	}

	/// The redirect hops that led to this request, oldest first.
	pub fn redirect_chain(&self) -> Vec<Arc<HttpRequest>> {
		self.redirect_chain.lock().clone()
	}

	/// Lets an intercepted request proceed unmodified.
	pub async fn continue_request(&self) -> Result<()> {
		let interception_id = self.require_interception("continue")?;
		let params = ContinueRequestParams {
			request_id: interception_id,
		};
		self.session
			.send("Fetch.continueRequest", serde_json::to_value(&params)?)
			.await?;
		Ok(())
	}

	/// Aborts an intercepted request.
	pub async fn abort(&self) -> Result<()> {
		let interception_id = self.require_interception("abort")?;
		let params = FailRequestParams {
			request_id: interception_id,
			error_reason: "Failed".to_string(),
		};
		self.session
			.send("Fetch.failRequest", serde_json::to_value(&params)?)
			.await?;
		Ok(())
	}

	fn require_interception(&self, action: &str) -> Result<String> {
		let Some(id) = self.interception_id.clone() else {
			return Err(Error::InvalidArgument(format!(
				"cannot {action} a request that was not intercepted"
			)));
		};
		if self.handled.swap(true, Ordering::SeqCst) {
			return Err(Error::InvalidArgument(
				"request is already handled".to_string(),
			));
		}
		Ok(id)
	}

	pub(crate) fn redirect_chain_handle(&self) -> RedirectChain {
		Arc::clone(&self.redirect_chain)
	}

	pub(crate) fn set_response(&self, response: Arc<HttpResponse>) {
		*self.response.lock() = Some(response);
	}

	pub(crate) fn set_failure(&self, error_text: &str) {
		*self.failure_text.lock() = Some(error_text.to_string());
	}

	pub(crate) fn mark_from_memory_cache(&self) {
		self.from_memory_cache.store(true, Ordering::SeqCst);
	}
}

impl std::fmt::Debug for HttpRequest {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HttpRequest")
			.field("id", &self.id)
			.field("method", &self.method)
			.field("url", &self.url)
			.finish()
	}
}
