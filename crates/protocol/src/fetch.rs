//! `Fetch` domain: request interception.
//!
//! When interception is active every request additionally pauses with
//! its own per-hop `requestId` (the "fetch request id"); `networkId`
//! links it back to the stable `Network` domain request id.

use serde::{Deserialize, Serialize};

use crate::network::RequestPayload;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPausedEvent {
	/// Per-hop interception id; changes across redirect hops.
	pub request_id: String,
	pub request: RequestPayload,
	#[serde(default)]
	pub frame_id: Option<String>,
	#[serde(default)]
	pub resource_type: Option<String>,
	/// The stable `Network.requestWillBeSent` request id, when known.
	#[serde(default)]
	pub network_id: Option<String>,
	#[serde(default)]
	pub response_status_code: Option<u16>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPattern {
	pub url_pattern: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnableParams {
	pub patterns: Vec<RequestPattern>,
	pub handle_auth_requests: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueRequestParams {
	pub request_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailRequestParams {
	pub request_id: String,
	pub error_reason: String,
}
