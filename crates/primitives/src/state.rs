//! Badge states and the sync layer's path states.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Overlay state of one path.
///
/// The discriminants travel across the process boundary and must never be
/// renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum BadgeState {
	/// Synced; no badge.
	#[default]
	None = 0,
	Syncing = 1,
	Failed = 2,
	/// Excluded from sync. Suppresses badges on the whole subtree beneath it.
	SyncSelective = 3,
}

/// An ordinal or name that does not correspond to any [`BadgeState`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnknownBadgeState {
	#[error("unknown badge state ordinal {0}")]
	Ordinal(u32),
	#[error("unknown badge state name {0:?}")]
	Name(String),
}

impl BadgeState {
	/// Wire ordinal.
	pub const fn ordinal(self) -> u32 {
		self as u32
	}

	pub const fn is_none(self) -> bool {
		matches!(self, Self::None)
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::None => "none",
			Self::Syncing => "syncing",
			Self::Failed => "failed",
			Self::SyncSelective => "selective",
		}
	}
}

impl TryFrom<u32> for BadgeState {
	type Error = UnknownBadgeState;

	fn try_from(ordinal: u32) -> Result<Self, Self::Error> {
		match ordinal {
			0 => Ok(Self::None),
			1 => Ok(Self::Syncing),
			2 => Ok(Self::Failed),
			3 => Ok(Self::SyncSelective),
			other => Err(UnknownBadgeState::Ordinal(other)),
		}
	}
}

impl From<BadgeState> for u32 {
	fn from(state: BadgeState) -> Self {
		state.ordinal()
	}
}

impl fmt::Display for BadgeState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for BadgeState {
	type Err = UnknownBadgeState;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"none" | "synced" => Ok(Self::None),
			"syncing" => Ok(Self::Syncing),
			"failed" => Ok(Self::Failed),
			"selective" | "syncselective" | "sync_selective" => Ok(Self::SyncSelective),
			_ => Err(UnknownBadgeState::Name(s.to_string())),
		}
	}
}

/// Per-path status reported by the sync layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathState {
	Synced,
	Syncing,
	Failed,
	/// Excluded by selective sync.
	Excluded,
}

impl From<PathState> for BadgeState {
	fn from(state: PathState) -> Self {
		match state {
			PathState::Synced => Self::None,
			PathState::Syncing => Self::Syncing,
			PathState::Failed => Self::Failed,
			PathState::Excluded => Self::SyncSelective,
		}
	}
}
