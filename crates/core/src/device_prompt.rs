//! Device request prompts (WebBluetooth / WebUSB chooser dialogs).

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use cdp_protocol::device_access::{
	CancelPromptParams, DeviceRequestPromptedEvent, PromptDevice, SelectPromptParams,
};
use cdp_runtime::{CdpSession, Error, ProtocolEvent, Result, SessionEvent};

use crate::util::AbortSignal;

/// Waits for `DeviceAccess.deviceRequestPrompted` on one session.
/// The domain is enabled lazily on the first wait.
pub struct DeviceRequestPromptManager {
	session: Arc<CdpSession>,
	enabled: AtomicBool,
}

impl DeviceRequestPromptManager {
	pub(crate) fn new(session: Arc<CdpSession>) -> Self {
		Self {
			session,
			enabled: AtomicBool::new(false),
		}
	}

	/// Resolves with the next prompt to open. Subscribes before
	/// enabling the domain so a prompt raised by the enable itself is
	/// not missed.
	pub async fn wait_for_prompt(
		&self,
		timeout: Duration,
		signal: Option<AbortSignal>,
	) -> Result<Arc<DeviceRequestPrompt>> {
		let mut events = self.session.subscribe();
		if !self.enabled.swap(true, Ordering::SeqCst) {
			self.session
				.send("DeviceAccess.enable", serde_json::json!({}))
				.await?;
		}
		let deadline = tokio::time::sleep(timeout);
		tokio::pin!(deadline);
		loop {
			let event = tokio::select! {
				event = events.recv() => event,
				() = &mut deadline => {
					return Err(Error::Timeout(format!(
						"Waiting for `DeviceRequestPrompt` failed: {}ms exceeded",
						timeout.as_millis()
					)));
				}
				reason = abort_or_never(signal.clone()) => {
					return Err(Error::Aborted(reason));
				}
			};
			let event = match event {
				Ok(SessionEvent::Event(event)) => event,
				Ok(SessionEvent::Disconnected) => {
					return Err(Error::ConnectionClosed(
						"session closed while waiting for a device prompt".to_string(),
					));
				}
				Err(broadcast::error::RecvError::Lagged(_)) => continue,
				Err(broadcast::error::RecvError::Closed) => {
					return Err(Error::ConnectionClosed(
						"session closed while waiting for a device prompt".to_string(),
					));
				}
			};
			if event.method.as_ref() != "DeviceAccess.deviceRequestPrompted" {
				continue;
			}
			let prompted: DeviceRequestPromptedEvent =
				serde_json::from_value(event.params.as_ref().clone())?;
			return Ok(DeviceRequestPrompt::new(Arc::clone(&self.session), prompted));
		}
	}
}

/// An open device chooser. Devices may keep trickling in after the
/// prompt opens; [`wait_for_device`] observes updates as they land.
///
/// [`wait_for_device`]: DeviceRequestPrompt::wait_for_device
#[derive(Debug)]
pub struct DeviceRequestPrompt {
	session: Arc<CdpSession>,
	id: String,
	devices: Mutex<Vec<PromptDevice>>,
	device_notify: tokio::sync::Notify,
	handled: AtomicBool,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceRequestPrompt {
	fn new(session: Arc<CdpSession>, event: DeviceRequestPromptedEvent) -> Arc<Self> {
		let prompt = Arc::new(Self {
			session: Arc::clone(&session),
			id: event.id,
			devices: Mutex::new(event.devices),
			device_notify: tokio::sync::Notify::new(),
			handled: AtomicBool::new(false),
			tasks: Mutex::new(Vec::new()),
		});
		prompt.spawn_update_listener();
		prompt
	}

	pub fn devices(&self) -> Vec<PromptDevice> {
		self.devices.lock().clone()
	}

	/// Resolves with the first known device matching `filter`, waiting
	/// for later `deviceRequestPrompted` updates when none does yet.
	pub async fn wait_for_device(
		&self,
		filter: impl Fn(&PromptDevice) -> bool,
		timeout: Duration,
	) -> Result<PromptDevice> {
		let deadline = tokio::time::sleep(timeout);
		tokio::pin!(deadline);
		loop {
			let notified = self.device_notify.notified();
			if let Some(device) = self.devices.lock().iter().find(|d| filter(d)).cloned() {
				return Ok(device);
			}
			tokio::select! {
				() = notified => {}
				() = &mut deadline => {
					return Err(Error::Timeout(format!(
						"Waiting for device failed: {}ms exceeded",
						timeout.as_millis()
					)));
				}
			}
		}
	}

	/// Chooses `device`, closing the prompt.
	pub async fn select(&self, device: &PromptDevice) -> Result<()> {
		self.mark_handled()?;
		let params = SelectPromptParams {
			id: self.id.clone(),
			device_id: device.id.clone(),
		};
		self.session
			.send("DeviceAccess.selectPrompt", serde_json::to_value(&params)?)
			.await?;
		Ok(())
	}

	/// Closes the prompt without choosing a device.
	pub async fn cancel(&self) -> Result<()> {
		self.mark_handled()?;
		let params = CancelPromptParams {
			id: self.id.clone(),
		};
		self.session
			.send("DeviceAccess.cancelPrompt", serde_json::to_value(&params)?)
			.await?;
		Ok(())
	}

	fn mark_handled(&self) -> Result<()> {
		if self.handled.swap(true, Ordering::SeqCst) {
			return Err(Error::InvalidArgument(
				"device prompt is already handled".to_string(),
			));
		}
		Ok(())
	}

	fn spawn_update_listener(self: &Arc<Self>) {
		let weak = Arc::downgrade(self);
		let mut events = self.session.subscribe();
		let task = tokio::spawn(async move {
			loop {
				let event = match events.recv().await {
					Ok(SessionEvent::Event(event)) => event,
					Ok(SessionEvent::Disconnected) => break,
					Err(broadcast::error::RecvError::Lagged(_)) => continue,
					Err(broadcast::error::RecvError::Closed) => break,
				};
				let Some(prompt) = weak.upgrade() else {
					break;
				};
				prompt.on_session_event(&event);
			}
		});
		self.tasks.lock().push(task);
	}

	fn on_session_event(&self, event: &ProtocolEvent) {
		if event.method.as_ref() != "DeviceAccess.deviceRequestPrompted" {
			return;
		}
		let Ok(update) =
			serde_json::from_value::<DeviceRequestPromptedEvent>(event.params.as_ref().clone())
		else {
			return;
		};
		if update.id != self.id {
			return;
		}
		let mut devices = self.devices.lock();
		for device in update.devices {
			if !devices.contains(&device) {
				devices.push(device);
			}
		}
		drop(devices);
		self.device_notify.notify_waiters();
	}
}

impl Drop for DeviceRequestPrompt {
	fn drop(&mut self) {
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
	}
}

async fn abort_or_never(signal: Option<AbortSignal>) -> String {
	match signal {
		Some(signal) => signal.aborted().await,
		None => std::future::pending().await,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_util::{attached_session, auto_respond};

	fn prompted_json(session_id: &str, id: &str, devices: serde_json::Value) -> String {
		serde_json::json!({
			"sessionId": session_id,
			"method": "DeviceAccess.deviceRequestPrompted",
			"params": {"id": id, "devices": devices},
		})
		.to_string()
	}

	#[tokio::test]
	async fn resolves_with_the_next_prompt() {
		let (_connection, session, handle) = attached_session().await;
		let incoming = handle.incoming.clone();
		let _responder = auto_respond(handle, |_, _| serde_json::json!({}));

		let manager = DeviceRequestPromptManager::new(session);
		let wait = manager.wait_for_prompt(Duration::from_secs(1), None);
		tokio::pin!(wait);

		// Give the waiter time to subscribe and enable the domain.
		tokio::select! {
			_ = &mut wait => panic!("no prompt was raised yet"),
			() = tokio::time::sleep(Duration::from_millis(50)) => {}
		}
		incoming
			.send(prompted_json("S1", "prompt-1", serde_json::json!([])))
			.unwrap();
		let prompt = wait.await.unwrap();
		assert!(prompt.devices().is_empty());
	}

	#[tokio::test]
	async fn late_device_updates_feed_the_device_wait() {
		let (_connection, session, handle) = attached_session().await;
		let incoming = handle.incoming.clone();
		let _responder = auto_respond(handle, |_, _| serde_json::json!({}));

		let manager = DeviceRequestPromptManager::new(session);
		let wait = manager.wait_for_prompt(Duration::from_secs(1), None);
		tokio::pin!(wait);
		tokio::select! {
			_ = &mut wait => panic!("no prompt was raised yet"),
			() = tokio::time::sleep(Duration::from_millis(50)) => {}
		}
		incoming
			.send(prompted_json("S1", "prompt-1", serde_json::json!([])))
			.unwrap();
		let prompt = wait.await.unwrap();

		incoming
			.send(prompted_json(
				"S1",
				"prompt-1",
				serde_json::json!([{"id": "d-1", "name": "Pixel"}]),
			))
			.unwrap();
		let device = prompt
			.wait_for_device(|d| d.name == "Pixel", Duration::from_secs(1))
			.await
			.unwrap();
		assert_eq!(device.id, "d-1");
	}

	#[tokio::test]
	async fn double_handling_is_an_error() {
		let (_connection, session, handle) = attached_session().await;
		let incoming = handle.incoming.clone();
		let _responder = auto_respond(handle, |_, _| serde_json::json!({}));

		let manager = DeviceRequestPromptManager::new(session);
		let wait = manager.wait_for_prompt(Duration::from_secs(1), None);
		tokio::pin!(wait);
		tokio::select! {
			_ = &mut wait => panic!("no prompt was raised yet"),
			() = tokio::time::sleep(Duration::from_millis(50)) => {}
		}
		incoming
			.send(prompted_json(
				"S1",
				"prompt-1",
				serde_json::json!([{"id": "d-1", "name": "Pixel"}]),
			))
			.unwrap();
		let prompt = wait.await.unwrap();

		prompt.cancel().await.unwrap();
		let error = prompt
			.select(&PromptDevice {
				id: "d-1".to_string(),
				name: "Pixel".to_string(),
			})
			.await
			.unwrap_err();
		assert!(error.to_string().contains("already handled"));
	}

	#[tokio::test]
	async fn abort_rejects_before_the_timeout() {
		let (_connection, session, handle) = attached_session().await;
		let _responder = auto_respond(handle, |_, _| serde_json::json!({}));

		let manager = DeviceRequestPromptManager::new(session);
		let controller = crate::util::AbortController::new();
		let signal = controller.signal();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(20)).await;
			controller.abort("operator cancelled");
		});
		let error = manager
			.wait_for_prompt(Duration::from_secs(30), Some(signal))
			.await
			.unwrap_err();
		assert!(error.is_aborted());
	}
}
