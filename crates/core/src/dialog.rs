//! JavaScript dialogs (alert, confirm, prompt, beforeunload).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cdp_protocol::page::{HandleJavaScriptDialogParams, JavascriptDialogOpeningEvent};
use cdp_runtime::{CdpSession, Error, Result};

/// An open dialog. The page stays blocked until it is accepted or
/// dismissed exactly once.
pub struct Dialog {
	session: Arc<CdpSession>,
	kind: String,
	message: String,
	default_value: String,
	handled: AtomicBool,
}

impl Dialog {
	pub(crate) fn new(session: Arc<CdpSession>, event: &JavascriptDialogOpeningEvent) -> Arc<Self> {
		Arc::new(Self {
			session,
			kind: event.kind.clone(),
			message: event.message.clone(),
			default_value: event.default_prompt.clone().unwrap_or_default(),
			handled: AtomicBool::new(false),
		})
	}

	/// Dialog type: "alert", "confirm", "prompt" or "beforeunload".
	pub fn kind(&self) -> &str {
		&self.kind
	}

	pub fn message(&self) -> &str {
		&self.message
	}

	pub fn default_value(&self) -> &str {
		&self.default_value
	}

	pub fn handled(&self) -> bool {
		self.handled.load(Ordering::SeqCst)
	}

	/// Accepts the dialog, optionally entering `prompt_text` for
	/// prompt dialogs.
	pub async fn accept(&self, prompt_text: Option<&str>) -> Result<()> {
		self.handle(true, prompt_text).await
	}

	pub async fn dismiss(&self) -> Result<()> {
		self.handle(false, None).await
	}

	async fn handle(&self, accept: bool, prompt_text: Option<&str>) -> Result<()> {
		if self.handled.swap(true, Ordering::SeqCst) {
			return Err(Error::InvalidArgument(
				"dialog is already handled".to_string(),
			));
		}
		let params = HandleJavaScriptDialogParams {
			accept,
			prompt_text: prompt_text.map(str::to_string),
		};
		self.session
			.send("Page.handleJavaScriptDialog", serde_json::to_value(&params)?)
			.await?;
		Ok(())
	}
}

impl std::fmt::Debug for Dialog {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Dialog")
			.field("kind", &self.kind)
			.field("message", &self.message)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_util::{attached_session, auto_respond};

	#[tokio::test]
	async fn second_handling_attempt_is_an_error() {
		let (_connection, session, handle) = attached_session().await;
		let _responder = auto_respond(handle, |_, _| serde_json::json!({}));

		let event: JavascriptDialogOpeningEvent = serde_json::from_value(serde_json::json!({
			"url": "http://a.test/",
			"message": "sure?",
			"type": "confirm",
		}))
		.unwrap();
		let dialog = Dialog::new(session, &event);

		dialog.accept(None).await.unwrap();
		assert!(dialog.handled());
		let error = dialog.dismiss().await.unwrap_err();
		assert!(error.to_string().contains("already handled"));
	}
}
