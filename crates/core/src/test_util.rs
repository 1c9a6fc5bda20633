//! Shared test scaffolding: an in-process connection with one
//! pre-attached page session ("S1" on target "T1").

use std::sync::Arc;
use std::time::Duration;

use cdp_runtime::transport::bridge::{self, BridgeHandle};
use cdp_runtime::{CdpSession, Connection, ConnectionEvent};

pub fn attached_frame_json(session_id: &str, target_id: &str, kind: &str) -> String {
	serde_json::json!({
		"method": "Target.attachedToTarget",
		"params": {
			"sessionId": session_id,
			"targetInfo": {
				"targetId": target_id,
				"type": kind,
				"title": "",
				"url": "about:blank",
				"attached": true,
			},
			"waitingForDebugger": false,
		},
	})
	.to_string()
}

/// Replies to every outgoing command with `results(method, params)`,
/// echoing the command's `sessionId`. Keep the returned handle alive
/// for the duration of the test.
pub fn auto_respond(
	mut handle: BridgeHandle,
	results: impl Fn(&str, &serde_json::Value) -> serde_json::Value + Send + 'static,
) -> tokio::task::JoinHandle<()> {
	let incoming = handle.incoming.clone();
	tokio::spawn(async move {
		while let Some(frame) = handle.outgoing.recv().await {
			let command: serde_json::Value = match serde_json::from_str(&frame) {
				Ok(command) => command,
				Err(_) => continue,
			};
			let Some(id) = command.get("id").cloned() else {
				continue;
			};
			let method = command["method"].as_str().unwrap_or_default().to_string();
			let params = command.get("params").cloned().unwrap_or_default();
			let mut reply = serde_json::json!({"id": id, "result": results(&method, &params)});
			if let Some(session_id) = command.get("sessionId") {
				reply["sessionId"] = session_id.clone();
			}
			if incoming.send(reply.to_string()).is_err() {
				break;
			}
		}
	})
}

pub async fn attached_session() -> (Arc<Connection>, Arc<CdpSession>, BridgeHandle) {
	let (parts, handle) = bridge::pair();
	let connection = Connection::with_transport(parts);
	handle
		.incoming
		.send(attached_frame_json("S1", "T1", "page"))
		.unwrap();
	connection
		.wait_for_event(Duration::from_secs(1), |event| {
			matches!(event, ConnectionEvent::SessionAttached(_))
		})
		.await
		.unwrap();
	let session = connection.session("S1").unwrap();
	(connection, session, handle)
}
