//! `Network` domain: request/response telemetry events.
//!
//! A single logical request surfaces as several independently-ordered
//! event streams; the client reconciles them by `requestId`, which is
//! stable across a redirect chain.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
	pub url: String,
	pub method: String,
	#[serde(default)]
	pub headers: HashMap<String, String>,
	#[serde(default)]
	pub post_data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
	pub url: String,
	pub status: u16,
	#[serde(default)]
	pub status_text: String,
	#[serde(default)]
	pub headers: HashMap<String, String>,
	#[serde(default)]
	pub from_disk_cache: bool,
	#[serde(default)]
	pub remote_ip_address: Option<String>,
	#[serde(default)]
	pub remote_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestWillBeSentEvent {
	pub request_id: String,
	pub loader_id: String,
	#[serde(rename = "documentURL", default)]
	pub document_url: Option<String>,
	pub request: RequestPayload,
	/// Present when this event reports a redirect hop; describes the
	/// response that caused the redirect.
	#[serde(default)]
	pub redirect_response: Option<ResponsePayload>,
	#[serde(default)]
	pub redirect_has_extra_info: bool,
	#[serde(rename = "type", default)]
	pub resource_type: Option<String>,
	#[serde(default)]
	pub frame_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseReceivedEvent {
	pub request_id: String,
	#[serde(default)]
	pub loader_id: Option<String>,
	pub response: ResponsePayload,
	#[serde(default)]
	pub has_extra_info: bool,
	#[serde(rename = "type", default)]
	pub resource_type: Option<String>,
	#[serde(default)]
	pub frame_id: Option<String>,
}

/// Out-of-band response metadata. Can arrive before or after the main
/// [`ResponseReceivedEvent`]; redirect chains produce one per hop.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseReceivedExtraInfoEvent {
	pub request_id: String,
	#[serde(default)]
	pub headers: HashMap<String, String>,
	#[serde(default)]
	pub status_code: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFinishedEvent {
	pub request_id: String,
	#[serde(default)]
	pub encoded_data_length: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFailedEvent {
	pub request_id: String,
	pub error_text: String,
	#[serde(default)]
	pub canceled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestServedFromCacheEvent {
	pub request_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResponseBodyParams {
	pub request_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResponseBodyResponse {
	pub body: String,
	#[serde(default)]
	pub base64_encoded: bool,
}
