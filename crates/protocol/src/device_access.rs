//! `DeviceAccess` domain: device request prompts (WebBluetooth/WebUSB).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptDevice {
	pub id: String,
	pub name: String,
}

/// Fired when a device request prompt opens, and again whenever the
/// set of requestable devices for an open prompt changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequestPromptedEvent {
	pub id: String,
	#[serde(default)]
	pub devices: Vec<PromptDevice>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectPromptParams {
	pub id: String,
	pub device_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelPromptParams {
	pub id: String,
}
