//! A JavaScript execution context inside a frame or worker realm.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cdp_protocol::runtime::{
	CallArgument, CallFunctionOnParams, EvaluateParams, EvaluateResponse, ExceptionDetails,
	ReleaseObjectParams, RemoteObject,
};
use cdp_runtime::{CdpSession, Error, Result};

/// Handle to one live `Runtime` execution context.
///
/// Contexts are created and destroyed by the browser as documents
/// navigate; holders must be prepared for any call to fail with a
/// "context destroyed" protocol error.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
	id: i64,
	session: Arc<CdpSession>,
}

impl ExecutionContext {
	pub fn new(id: i64, session: Arc<CdpSession>) -> Self {
		Self { id, session }
	}

	pub fn id(&self) -> i64 {
		self.id
	}

	pub fn session(&self) -> &Arc<CdpSession> {
		&self.session
	}

	/// Evaluates a JavaScript expression, returning its JSON value.
	///
	/// Promises are awaited; a thrown exception surfaces as
	/// [`Error::Evaluation`].
	pub async fn evaluate(&self, expression: &str) -> Result<Value> {
		let params = EvaluateParams {
			expression: expression.to_string(),
			context_id: self.id,
			return_by_value: true,
			await_promise: true,
		};
		let result = self
			.session
			.send("Runtime.evaluate", serde_json::to_value(&params)?)
			.await?;
		let response: EvaluateResponse = serde_json::from_value(result)?;
		Self::unwrap_value(response)
	}

	/// Calls a JavaScript function declaration with the given
	/// arguments, returning its JSON result.
	pub async fn call_function(&self, declaration: &str, args: Vec<Value>) -> Result<Value> {
		let params = CallFunctionOnParams {
			function_declaration: declaration.to_string(),
			execution_context_id: Some(self.id),
			object_id: None,
			arguments: args
				.into_iter()
				.map(|value| CallArgument {
					value: Some(value),
					object_id: None,
				})
				.collect(),
			return_by_value: true,
			await_promise: true,
		};
		let result = self
			.session
			.send("Runtime.callFunctionOn", serde_json::to_value(&params)?)
			.await?;
		let response: EvaluateResponse = serde_json::from_value(result)?;
		Self::unwrap_value(response)
	}

	/// Evaluates an expression and returns a live handle to the
	/// resulting remote object instead of serializing it.
	pub async fn evaluate_handle(&self, expression: &str) -> Result<RemoteHandle> {
		let params = EvaluateParams {
			expression: expression.to_string(),
			context_id: self.id,
			return_by_value: false,
			await_promise: true,
		};
		let result = self
			.session
			.send("Runtime.evaluate", serde_json::to_value(&params)?)
			.await?;
		let response: EvaluateResponse = serde_json::from_value(result)?;
		if let Some(details) = &response.exception_details {
			return Err(evaluation_error(details));
		}
		Ok(RemoteHandle::new(Arc::clone(&self.session), response.result))
	}

	fn unwrap_value(response: EvaluateResponse) -> Result<Value> {
		if let Some(details) = &response.exception_details {
			return Err(evaluation_error(details));
		}
		Ok(response.result.value.unwrap_or(Value::Null))
	}
}

fn evaluation_error(details: &ExceptionDetails) -> Error {
	let message = details
		.exception
		.as_ref()
		.and_then(|exception| exception.description.clone())
		.unwrap_or_else(|| details.text.clone());
	Error::Evaluation(message)
}

/// A live reference to a remote JavaScript object.
///
/// The backing object stays pinned in the browser until
/// [`RemoteHandle::dispose`] releases it (or the context goes away).
pub struct RemoteHandle {
	session: Arc<CdpSession>,
	remote: RemoteObject,
	disposed: AtomicBool,
}

impl RemoteHandle {
	fn new(session: Arc<CdpSession>, remote: RemoteObject) -> Self {
		Self {
			session,
			remote,
			disposed: AtomicBool::new(false),
		}
	}

	pub fn remote_object(&self) -> &RemoteObject {
		&self.remote
	}

	pub fn object_id(&self) -> Option<&str> {
		self.remote.object_id.as_deref()
	}

	pub fn description(&self) -> Option<&str> {
		self.remote.description.as_deref()
	}

	/// Calls a function with the live remote object bound as `this`,
	/// so the result reflects the object's current state rather than a
	/// snapshot.
	pub async fn call_function(&self, declaration: &str, args: Vec<Value>) -> Result<Value> {
		let Some(object_id) = self.remote.object_id.clone() else {
			return Err(Error::InvalidArgument(
				"handle is a primitive value, not a remote object".to_string(),
			));
		};
		let params = CallFunctionOnParams {
			function_declaration: declaration.to_string(),
			execution_context_id: None,
			object_id: Some(object_id),
			arguments: args
				.into_iter()
				.map(|value| CallArgument {
					value: Some(value),
					object_id: None,
				})
				.collect(),
			return_by_value: true,
			await_promise: true,
		};
		let result = self
			.session
			.send("Runtime.callFunctionOn", serde_json::to_value(&params)?)
			.await?;
		let response: EvaluateResponse = serde_json::from_value(result)?;
		ExecutionContext::unwrap_value(response)
	}

	/// Releases the remote object. Idempotent; release failures after
	/// a navigation are expected and swallowed.
	pub async fn dispose(&self) -> Result<()> {
		if self.disposed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		let Some(object_id) = self.remote.object_id.clone() else {
			return Ok(());
		};
		let params = ReleaseObjectParams { object_id };
		if let Err(e) = self
			.session
			.send("Runtime.releaseObject", serde_json::to_value(&params)?)
			.await
		{
			tracing::debug!("releaseObject failed: {e}");
		}
		Ok(())
	}
}
