//! `Target` domain: discovery, attachment and lifecycle of debuggable targets.

use serde::{Deserialize, Serialize};

/// Description of a debuggable target, updated in place as
/// `Target.targetInfoChanged` events arrive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
	pub target_id: String,
	/// Target type: "page", "background_page", "service_worker",
	/// "shared_worker", "browser", "webview", "tab" or other.
	#[serde(rename = "type")]
	pub kind: String,
	pub title: String,
	pub url: String,
	pub attached: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub opener_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub browser_context_id: Option<String>,
	/// Non-empty for secondary views of a target, e.g. prerendered pages.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub subtype: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetCreatedEvent {
	pub target_info: TargetInfo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDestroyedEvent {
	pub target_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfoChangedEvent {
	pub target_info: TargetInfo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedToTargetEvent {
	pub session_id: String,
	pub target_info: TargetInfo,
	#[serde(default)]
	pub waiting_for_debugger: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachedFromTargetEvent {
	pub session_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub target_id: Option<String>,
}

/// Entry of a target discovery/auto-attach filter. An empty entry
/// matches every target.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterEntry {
	#[serde(rename = "type", skip_serializing_if = "Option::is_none")]
	pub kind: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub exclude: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDiscoverTargetsParams {
	pub discover: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub filter: Option<Vec<FilterEntry>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetAutoAttachParams {
	pub auto_attach: bool,
	pub wait_for_debugger_on_start: bool,
	/// Enables "flat" access to the session via `sessionId` attribute.
	pub flatten: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub filter: Option<Vec<FilterEntry>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachToTargetParams {
	pub target_id: String,
	pub flatten: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachToTargetResponse {
	pub session_id: String,
}
