//! High-level client for driving Chromium-family browsers over the
//! DevTools protocol.
//!
//! [`Browser`] owns the connection and target discovery; each page
//! target surfaces as a [`Page`] with navigation, evaluation and
//! prompt waits built on the frame tree, isolated worlds and network
//! event reconciliation underneath.

pub mod browser;
pub mod device_prompt;
pub mod dialog;
pub mod execution_context;
pub mod frame;
pub mod frame_manager;
pub mod isolated_world;
pub mod lifecycle_watcher;
pub mod network;
pub mod page;
pub mod target;
pub mod target_manager;
pub mod timeout_settings;
pub mod util;
pub mod wait_task;
pub mod worker;

#[cfg(test)]
mod test_util;

pub use browser::{Browser, BrowserEvent};
pub use device_prompt::{DeviceRequestPrompt, DeviceRequestPromptManager};
pub use dialog::Dialog;
pub use execution_context::{ExecutionContext, RemoteHandle};
pub use frame::Frame;
pub use frame_manager::{FrameEvent, FrameManager};
pub use isolated_world::{IsolatedWorld, WorldKind};
pub use lifecycle_watcher::WaitUntil;
pub use network::{HttpRequest, HttpResponse, NetworkEvent, NetworkManager};
pub use page::{GotoOptions, Page, PageEvent};
pub use target::{InitializationStatus, Target, TargetKind};
pub use target_manager::{TargetEvent, TargetFilter, TargetManager};
pub use timeout_settings::TimeoutSettings;
pub use util::{AbortController, AbortSignal};
pub use wait_task::Polling;
pub use worker::WebWorker;

pub use cdp_runtime::{CdpSession, Connection, ConnectionEvent, Error, Result};
