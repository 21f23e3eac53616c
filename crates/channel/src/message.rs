//! Wire message and subscription vocabulary.

use std::fmt;

use serde::{Deserialize, Serialize};
use sigil_primitives::{BadgePath, BadgeState};
use uuid::Uuid;

use crate::ChannelError;

/// Event category. Subscriptions are per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
	/// Peer to engine: "I just initialized".
	PeerToCore,
	/// Engine to peers: badge and scope updates.
	CoreToPeer,
}

/// Sub-type within an [`EventType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSubType {
	/// A peer (re)initialized and needs a full snapshot.
	PeerInitialized,
	/// Show `state` on `path`.
	AddBadgePath,
	/// Drop any badge on `path`.
	RemoveBadgePath,
	/// Start badging beneath `path`.
	AddScopeRoot,
	/// Forget every badge beneath `path`.
	RemoveScopeRoot,
}

/// One notification as it crosses the channel.
///
/// `state` is the [`BadgeState`] ordinal; remove sub-types carry
/// [`BadgeState::None`] as a placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
	/// Event category.
	pub event: EventType,
	/// Event sub-type.
	pub sub_type: EventSubType,
	/// Badge ordinal.
	pub state: u32,
	/// Path string.
	pub path: String,
}

impl ChannelMessage {
	/// Engine-to-peer message.
	pub fn core(sub_type: EventSubType, state: BadgeState, path: &BadgePath) -> Self {
		Self {
			event: EventType::CoreToPeer,
			sub_type,
			state: state.ordinal(),
			path: path.to_string(),
		}
	}

	/// Peer-to-engine initialization announcement.
	pub fn peer_initialized() -> Self {
		Self {
			event: EventType::PeerToCore,
			sub_type: EventSubType::PeerInitialized,
			state: BadgeState::None.ordinal(),
			path: String::new(),
		}
	}

	/// Decoded badge state.
	pub fn badge_state(&self) -> Result<BadgeState, ChannelError> {
		Ok(BadgeState::try_from(self.state)?)
	}

	/// Parsed path.
	pub fn badge_path(&self) -> BadgePath {
		BadgePath::new(&self.path)
	}
}

/// Process-lifetime-unique subscriber identity.
///
/// Generated once per channel instance and reused across subscribe retries,
/// so a stalled subscribe can be cancelled by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
	/// Generates a fresh random identity.
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for SubscriberId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for SubscriberId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// Result of one bounded subscribe call.
#[derive(Debug)]
pub enum SubscribeOutcome {
	/// A message arrived.
	GotEvent(ChannelMessage),
	/// The endpoint was briefly unavailable; call again.
	TryAgain,
	/// Nothing arrived within the timeout; call again.
	TimedOut,
	/// The wait was cancelled by identity. Ends the subscribing loop.
	Cancelled,
	/// Transport failure. Ends the subscribing loop.
	Error(ChannelError),
}
