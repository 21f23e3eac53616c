//! Subscriber side of the badge protocol.
//!
//! A [`PeerMirror`] stands in for a shell extension: it announces itself on
//! the channel, then folds `CoreToPeer` traffic into a local view of scope
//! roots and badges.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sigil_channel::{ChannelError, ChannelMessage, EventSubType, EventType, NotificationChannel, SubscribeOutcome};
use sigil_primitives::{BadgePath, BadgeState};

#[derive(Default)]
struct PeerView {
	scopes: BTreeSet<BadgePath>,
	badges: BTreeMap<BadgePath, BadgeState>,
}

/// Local replica of what the engine has told this peer.
pub struct PeerMirror {
	channel: Arc<dyn NotificationChannel>,
	view: Mutex<PeerView>,
}

impl PeerMirror {
	pub fn new(channel: Arc<dyn NotificationChannel>) -> Self {
		Self {
			channel,
			view: Mutex::new(PeerView::default()),
		}
	}

	/// Starts listening for engine traffic, then asks the engine for a resync.
	pub fn announce(&self) -> Result<(), ChannelError> {
		// A zero-timeout subscribe registers this peer before the resync is requested.
		let registered = self.channel.subscribe(EventType::CoreToPeer, self.channel.subscriber_id(), Duration::ZERO);
		match registered {
			SubscribeOutcome::Error(err) => return Err(err),
			SubscribeOutcome::GotEvent(message) => {
				self.apply(&message);
			}
			_ => {}
		}
		self.channel.publish(&ChannelMessage::peer_initialized())?;
		tracing::debug!(subscriber = %self.channel.subscriber_id(), "overlay.peer.announced");
		Ok(())
	}

	/// Applies every message that arrives within `timeout`, draining whatever
	/// is already queued after the first one. Returns how many were applied.
	pub fn poll(&self, timeout: Duration) -> Result<usize, ChannelError> {
		let subscriber = self.channel.subscriber_id();
		let mut wait = timeout;
		let mut applied = 0usize;
		loop {
			match self.channel.subscribe(EventType::CoreToPeer, subscriber, wait) {
				SubscribeOutcome::GotEvent(message) => {
					if self.apply(&message) {
						applied += 1;
					}
					wait = Duration::ZERO;
				}
				SubscribeOutcome::TryAgain | SubscribeOutcome::TimedOut | SubscribeOutcome::Cancelled => return Ok(applied),
				SubscribeOutcome::Error(err) => return Err(err),
			}
		}
	}

	/// Folds one message into the view. Returns `false` for messages a peer ignores.
	pub fn apply(&self, message: &ChannelMessage) -> bool {
		if message.event != EventType::CoreToPeer {
			return false;
		}
		let path = message.badge_path();
		let mut view = self.view.lock();
		match message.sub_type {
			EventSubType::AddScopeRoot => {
				view.scopes.insert(path);
			}
			EventSubType::RemoveScopeRoot => {
				view.badges.retain(|badge, _| !badge.starts_with(&path));
				view.scopes.remove(&path);
			}
			EventSubType::AddBadgePath => match message.badge_state() {
				Ok(state) => {
					view.badges.insert(path, state);
				}
				Err(err) => {
					tracing::warn!(path = %path, error = %err, "overlay.peer.bad_state");
					return false;
				}
			},
			EventSubType::RemoveBadgePath => {
				view.badges.remove(&path);
			}
			EventSubType::PeerInitialized => return false,
		}
		true
	}

	/// Badge shown on `path`; `None` outside every known scope root.
	pub fn badge(&self, path: &BadgePath) -> BadgeState {
		let view = self.view.lock();
		if !view.scopes.iter().any(|scope| path.starts_with(scope)) {
			return BadgeState::None;
		}
		view.badges.get(path).copied().unwrap_or_default()
	}

	pub fn badges(&self) -> Vec<(BadgePath, BadgeState)> {
		self.view.lock().badges.iter().map(|(path, state)| (path.clone(), *state)).collect()
	}

	pub fn scopes(&self) -> Vec<BadgePath> {
		self.view.lock().scopes.iter().cloned().collect()
	}

	/// Releases the underlying channel.
	pub fn close(&self) {
		self.channel.terminate();
	}
}
