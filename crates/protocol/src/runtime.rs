//! `Runtime` domain: execution contexts and remote evaluation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextDescription {
	pub id: i64,
	#[serde(default)]
	pub origin: String,
	#[serde(default)]
	pub name: String,
	/// Embedder-specific data; for frames contains
	/// `{"frameId": ..., "isDefault": bool}`.
	#[serde(default)]
	pub aux_data: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextCreatedEvent {
	pub context: ExecutionContextDescription,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextDestroyedEvent {
	pub execution_context_id: i64,
}

/// Mirror of the browser-side object produced by an evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
	#[serde(rename = "type", default)]
	pub kind: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub subtype: Option<String>,
	/// Present when the value was returned by value.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub value: Option<Value>,
	/// Present for values that could not be serialized (NaN, -0, ...).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub unserializable_value: Option<String>,
	/// Present for live references; must be released when done.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub object_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
	#[serde(default)]
	pub text: String,
	#[serde(default)]
	pub line_number: i64,
	#[serde(default)]
	pub exception: Option<RemoteObject>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateParams {
	pub expression: String,
	pub context_id: i64,
	pub return_by_value: bool,
	pub await_promise: bool,
}

/// Argument to `Runtime.callFunctionOn`; either a plain value or a
/// reference to a live remote object.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallArgument {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub value: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub object_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFunctionOnParams {
	pub function_declaration: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub execution_context_id: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub object_id: Option<String>,
	pub arguments: Vec<CallArgument>,
	pub return_by_value: bool,
	pub await_promise: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponse {
	pub result: RemoteObject,
	#[serde(default)]
	pub exception_details: Option<ExceptionDetails>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseObjectParams {
	pub object_id: String,
}
