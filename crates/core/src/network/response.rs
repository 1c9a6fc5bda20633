//! One observed network response.

use base64::Engine;
use std::collections::HashMap;
use std::sync::Arc;

use cdp_protocol::network::{
	GetResponseBodyParams, GetResponseBodyResponse, ResponsePayload,
	ResponseReceivedExtraInfoEvent,
};
use cdp_runtime::{CdpSession, Error, Result};

use crate::util::Deferred;

pub struct HttpResponse {
	session: Arc<CdpSession>,
	request_id: String,
	url: String,
	status: u16,
	status_text: String,
	headers: HashMap<String, String>,
	from_disk_cache: bool,
	remote_ip_address: Option<String>,
	remote_port: Option<u16>,
	/// Settled once the body is safe to fetch (request completed) or
	/// known to be unavailable.
	body_loaded: Deferred<()>,
}

impl HttpResponse {
	/// Builds a response, preferring status and headers from the
	/// extra-info event when one was paired with it.
	pub(crate) fn new(
		session: Arc<CdpSession>,
		request_id: &str,
		payload: &ResponsePayload,
		extra_info: Option<&ResponseReceivedExtraInfoEvent>,
	) -> Arc<Self> {
		let status = extra_info
			.and_then(|extra| extra.status_code)
			.unwrap_or(payload.status);
		let mut headers = payload.headers.clone();
		if let Some(extra) = extra_info {
			headers.extend(extra.headers.clone());
		}
		Arc::new(Self {
			session,
			request_id: request_id.to_string(),
			url: payload.url.clone(),
			status,
			status_text: payload.status_text.clone(),
			headers,
			from_disk_cache: payload.from_disk_cache,
			remote_ip_address: payload.remote_ip_address.clone(),
			remote_port: payload.remote_port,
			body_loaded: Deferred::new(),
		})
	}

	pub fn request_id(&self) -> &str {
		&self.request_id
	}

	pub fn url(&self) -> &str {
		&self.url
	}

	pub fn status(&self) -> u16 {
		self.status
	}

	pub fn status_text(&self) -> &str {
		&self.status_text
	}

	pub fn ok(&self) -> bool {
		self.status == 0 || (200..300).contains(&self.status)
	}

	pub fn headers(&self) -> &HashMap<String, String> {
		&self.headers
	}

	pub fn from_disk_cache(&self) -> bool {
		self.from_disk_cache
	}

	pub fn remote_ip_address(&self) -> Option<&str> {
		self.remote_ip_address.as_deref()
	}

	pub fn remote_port(&self) -> Option<u16> {
		self.remote_port
	}

	/// Fetches the raw response body. Waits for the request to finish
	/// loading first.
	pub async fn body(&self) -> Result<Vec<u8>> {
		self.body_loaded.wait().await?;
		let params = GetResponseBodyParams {
			request_id: self.request_id.clone(),
		};
		let result = self
			.session
			.send("Network.getResponseBody", serde_json::to_value(&params)?)
			.await?;
		let response: GetResponseBodyResponse = serde_json::from_value(result)?;
		if response.base64_encoded {
			base64::engine::general_purpose::STANDARD
				.decode(response.body.as_bytes())
				.map_err(|e| Error::Json(format!("invalid base64 response body: {e}")))
		} else {
			Ok(response.body.into_bytes())
		}
	}

	/// The response body decoded as UTF-8.
	pub async fn text(&self) -> Result<String> {
		let body = self.body().await?;
		Ok(String::from_utf8_lossy(&body).into_owned())
	}

	pub(crate) fn resolve_body(&self, error: Option<Error>) {
		match error {
			None => self.body_loaded.resolve(()),
			Some(error) => self.body_loaded.reject(error),
		}
	}
}

impl std::fmt::Debug for HttpResponse {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HttpResponse")
			.field("request_id", &self.request_id)
			.field("status", &self.status)
			.field("url", &self.url)
			.finish()
	}
}
