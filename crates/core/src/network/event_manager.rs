//! Buffering for out-of-order network event streams.
//!
//! Chromium reports one logical request through several event streams
//! with no ordering guarantee between them. This module owns the
//! holding pens: events that arrived before their counterpart wait
//! here, keyed by the stable network request ID, until the missing
//! piece shows up or the request is forgotten.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use cdp_protocol::fetch::RequestPausedEvent;
use cdp_protocol::network::{
	LoadingFailedEvent, LoadingFinishedEvent, RequestWillBeSentEvent,
	ResponseReceivedEvent, ResponseReceivedExtraInfoEvent,
};

use super::request::HttpRequest;

/// A redirect hop parked until its extra-info event arrives.
pub(crate) struct RedirectInfo {
	pub event: RequestWillBeSentEvent,
	pub fetch_request_id: Option<String>,
}

/// A response (and any completion events that followed it) parked
/// until its extra-info event arrives.
pub(crate) struct QueuedEventGroup {
	pub response: ResponseReceivedEvent,
	pub loading_finished: Option<LoadingFinishedEvent>,
	pub loading_failed: Option<LoadingFailedEvent>,
}

#[derive(Default)]
pub(crate) struct NetworkEventManager {
	request_will_be_sent: HashMap<String, RequestWillBeSentEvent>,
	request_paused: HashMap<String, RequestPausedEvent>,
	requests: HashMap<String, Arc<HttpRequest>>,
	/// Extra-info events are matched to responses positionally; each
	/// redirect hop consumes exactly one entry in order.
	response_extra_info: HashMap<String, VecDeque<ResponseReceivedExtraInfoEvent>>,
	queued_redirect_info: HashMap<String, VecDeque<RedirectInfo>>,
	queued_event_groups: HashMap<String, QueuedEventGroup>,
}

impl NetworkEventManager {
	pub fn new() -> Self {
		Self::default()
	}

	/// Drops every buffer held for `network_id`. Called exactly once
	/// when a request completes, fails, or is superseded.
	pub fn forget(&mut self, network_id: &str) {
		self.request_will_be_sent.remove(network_id);
		self.request_paused.remove(network_id);
		self.queued_event_groups.remove(network_id);
		self.queued_redirect_info.remove(network_id);
		self.response_extra_info.remove(network_id);
	}

	pub fn store_request_will_be_sent(&mut self, network_id: &str, event: RequestWillBeSentEvent) {
		self.request_will_be_sent.insert(network_id.to_string(), event);
	}

	pub fn request_will_be_sent(&self, network_id: &str) -> Option<&RequestWillBeSentEvent> {
		self.request_will_be_sent.get(network_id)
	}

	pub fn forget_request_will_be_sent(&mut self, network_id: &str) {
		self.request_will_be_sent.remove(network_id);
	}

	pub fn store_request_paused(&mut self, network_id: &str, event: RequestPausedEvent) {
		self.request_paused.insert(network_id.to_string(), event);
	}

	pub fn request_paused(&self, network_id: &str) -> Option<&RequestPausedEvent> {
		self.request_paused.get(network_id)
	}

	pub fn forget_request_paused(&mut self, network_id: &str) {
		self.request_paused.remove(network_id);
	}

	pub fn store_request(&mut self, network_id: &str, request: Arc<HttpRequest>) {
		self.requests.insert(network_id.to_string(), request);
	}

	pub fn request(&self, network_id: &str) -> Option<Arc<HttpRequest>> {
		self.requests.get(network_id).cloned()
	}

	pub fn forget_request(&mut self, network_id: &str) {
		self.requests.remove(network_id);
	}

	pub fn response_extra_info(&mut self, network_id: &str) -> &mut VecDeque<ResponseReceivedExtraInfoEvent> {
		self.response_extra_info
			.entry(network_id.to_string())
			.or_default()
	}

	pub fn queue_redirect_info(&mut self, network_id: &str, info: RedirectInfo) {
		self.queued_redirect_info
			.entry(network_id.to_string())
			.or_default()
			.push_back(info);
	}

	pub fn take_queued_redirect_info(&mut self, network_id: &str) -> Option<RedirectInfo> {
		self.queued_redirect_info
			.get_mut(network_id)
			.and_then(VecDeque::pop_front)
	}

	pub fn queue_event_group(&mut self, network_id: &str, group: QueuedEventGroup) {
		self.queued_event_groups.insert(network_id.to_string(), group);
	}

	pub fn queued_event_group_mut(&mut self, network_id: &str) -> Option<&mut QueuedEventGroup> {
		self.queued_event_groups.get_mut(network_id)
	}

	pub fn take_queued_event_group(&mut self, network_id: &str) -> Option<QueuedEventGroup> {
		self.queued_event_groups.remove(network_id)
	}

	#[cfg(test)]
	pub fn is_clean(&self, network_id: &str) -> bool {
		!self.request_will_be_sent.contains_key(network_id)
			&& !self.request_paused.contains_key(network_id)
			&& !self.queued_event_groups.contains_key(network_id)
			&& !self
				.queued_redirect_info
				.get(network_id)
				.is_some_and(|q| !q.is_empty())
			&& !self
				.response_extra_info
				.get(network_id)
				.is_some_and(|q| !q.is_empty())
			&& !self.requests.contains_key(network_id)
	}
}
