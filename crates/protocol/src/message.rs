//! The DevTools protocol message envelope.
//!
//! Every frame on the wire is a JSON object of the shape
//! `{id?, method?, params?, result?, error?, sessionId?}`. Outbound
//! commands carry `id` (+ optional `sessionId`); inbound frames are
//! either responses (have `id`) or events (have `method`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Serde helpers for `Arc<str>` serialization.
pub fn serialize_arc_str<S>(arc: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
where
	S: serde::Serializer,
{
	serializer.serialize_str(arc)
}

pub fn deserialize_arc_str<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
where
	D: serde::Deserializer<'de>,
{
	let s: String = serde::Deserialize::deserialize(deserializer)?;
	Ok(Arc::from(s.as_str()))
}

fn deserialize_opt_arc_str<'de, D>(deserializer: D) -> Result<Option<Arc<str>>, D::Error>
where
	D: serde::Deserializer<'de>,
{
	let s: Option<String> = serde::Deserialize::deserialize(deserializer)?;
	Ok(s.map(|s| Arc::from(s.as_str())))
}

/// Protocol command sent to the browser.
#[derive(Debug, Clone, Serialize)]
pub struct Command {
	/// Unique request ID for correlating responses.
	pub id: u64,
	/// Method name to invoke, e.g. `"Page.navigate"`.
	pub method: String,
	/// Method parameters as a JSON object.
	pub params: Value,
	/// Session to scope the command to; absent for browser-level commands.
	#[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
}

/// Error payload the browser attaches to a failed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
	pub code: i64,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<String>,
}

/// Protocol response message (correlates to a [`Command`] by `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	pub id: u64,
	/// Success result (mutually exclusive with `error`).
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	/// Error result (mutually exclusive with `result`).
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<ErrorPayload>,
	/// Session the original command was scoped to.
	#[serde(
		rename = "sessionId",
		default,
		skip_serializing_if = "Option::is_none",
		deserialize_with = "deserialize_opt_arc_str"
	)]
	pub session_id: Option<Arc<str>>,
}

/// Protocol event message pushed by the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
	/// Event method name, e.g. `"Page.lifecycleEvent"`.
	#[serde(
		serialize_with = "serialize_arc_str",
		deserialize_with = "deserialize_arc_str"
	)]
	pub method: Arc<str>,
	/// Event parameters as a JSON object.
	#[serde(default)]
	pub params: Value,
	/// Session the event is scoped to; absent for browser-level events.
	#[serde(
		rename = "sessionId",
		default,
		skip_serializing_if = "Option::is_none",
		deserialize_with = "deserialize_opt_arc_str"
	)]
	pub session_id: Option<Arc<str>>,
}

/// Discriminated union of inbound protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
	/// Response message (has `id` field).
	Response(Response),
	/// Event message (has `method`, no `id`).
	Event(Event),
	/// Unknown message type (forward-compatible catch-all).
	Unknown(Value),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn response_frames_take_priority_over_events() {
		let json = r#"{"id": 42, "result": {"ok": true}, "sessionId": "S1"}"#;
		match serde_json::from_str::<Message>(json).unwrap() {
			Message::Response(response) => {
				assert_eq!(response.id, 42);
				assert_eq!(response.session_id.as_deref(), Some("S1"));
				assert!(response.error.is_none());
			}
			other => panic!("expected Response, got {other:?}"),
		}
	}

	#[test]
	fn event_frames_deserialize_with_and_without_session() {
		let json = r#"{"method": "Page.lifecycleEvent", "params": {"name": "load"}}"#;
		match serde_json::from_str::<Message>(json).unwrap() {
			Message::Event(event) => {
				assert_eq!(event.method.as_ref(), "Page.lifecycleEvent");
				assert_eq!(event.params["name"], "load");
				assert!(event.session_id.is_none());
			}
			other => panic!("expected Event, got {other:?}"),
		}

		let json = r#"{"method": "Network.loadingFinished", "params": {}, "sessionId": "S2"}"#;
		match serde_json::from_str::<Message>(json).unwrap() {
			Message::Event(event) => assert_eq!(event.session_id.as_deref(), Some("S2")),
			other => panic!("expected Event, got {other:?}"),
		}
	}

	#[test]
	fn command_serializes_without_null_session() {
		let command = Command {
			id: 1,
			method: "Target.setDiscoverTargets".to_string(),
			params: serde_json::json!({"discover": true}),
			session_id: None,
		};
		let value = serde_json::to_value(&command).unwrap();
		assert!(value.get("sessionId").is_none());
		assert_eq!(value["id"], 1);
	}
}
