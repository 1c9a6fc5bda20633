//! `Page` domain: frame tree, navigation and lifecycle events, dialogs.

use serde::{Deserialize, Serialize};

/// Frame description as reported by `Page.frameNavigated` and
/// `Page.getFrameTree`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FramePayload {
	pub id: String,
	#[serde(default)]
	pub parent_id: Option<String>,
	/// Changes exactly when the frame commits a new document load.
	pub loader_id: String,
	pub url: String,
	#[serde(default)]
	pub url_fragment: Option<String>,
	#[serde(default)]
	pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameTree {
	pub frame: FramePayload,
	#[serde(default)]
	pub child_frames: Option<Vec<FrameTree>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetFrameTreeResponse {
	pub frame_tree: FrameTree,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameAttachedEvent {
	pub frame_id: String,
	pub parent_frame_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameNavigatedEvent {
	pub frame: FramePayload,
	/// "Navigation" or "BackForwardCacheRestore".
	#[serde(rename = "type", default)]
	pub navigation_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameDetachedEvent {
	pub frame_id: String,
	/// "remove", or "swap" when the frame moved to another session.
	#[serde(default)]
	pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStartedLoadingEvent {
	pub frame_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStoppedLoadingEvent {
	pub frame_id: String,
}

/// Fired for every lifecycle milestone a frame reports: "init",
/// "load", "DOMContentLoaded", "networkIdle", "networkAlmostIdle", ...
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEventEvent {
	pub frame_id: String,
	pub loader_id: String,
	pub name: String,
	#[serde(default)]
	pub timestamp: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigatedWithinDocumentEvent {
	pub frame_id: String,
	pub url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigateParams {
	pub url: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub referrer: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub frame_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigateResponse {
	pub frame_id: String,
	/// Present for new-document navigations; absent for same-document.
	#[serde(default)]
	pub loader_id: Option<String>,
	/// Set when the navigation was blocked or failed synchronously.
	#[serde(default)]
	pub error_text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JavascriptDialogOpeningEvent {
	pub url: String,
	pub message: String,
	/// "alert", "confirm", "prompt" or "beforeunload".
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub default_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleJavaScriptDialogParams {
	pub accept: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub prompt_text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIsolatedWorldParams {
	pub frame_id: String,
	pub world_name: String,
	pub grant_univeral_access: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIsolatedWorldResponse {
	pub execution_context_id: i64,
}
