//! Error types for channel operations.

use sigil_primitives::UnknownBadgeState;
use thiserror::Error;

/// Errors raised by notification channels.
#[derive(Debug, Error)]
pub enum ChannelError {
	/// The channel was used before [`crate::NotificationChannel::initialize`].
	#[error("channel not initialized")]
	NotInitialized,

	/// The channel was terminated.
	#[error("channel terminated")]
	Terminated,

	/// The underlying endpoint could not be allocated.
	#[error("channel endpoint limit reached ({limit})")]
	ResourceExhausted {
		/// Maximum number of live endpoints.
		limit: usize,
	},

	/// An encoded message does not fit in one frame.
	#[error("message of {len} bytes exceeds frame limit of {limit}")]
	MessageTooLarge {
		/// Encoded length.
		len: usize,
		/// Frame limit.
		limit: usize,
	},

	/// Frame encoding or decoding failed.
	#[error("frame codec error: {0}")]
	Codec(#[from] postcard::Error),

	/// A frame carried an unknown badge ordinal.
	#[error(transparent)]
	InvalidBadgeState(#[from] UnknownBadgeState),

	/// The endpoint stayed locked past the contention bound.
	#[error("channel endpoint contended")]
	Contended,
}

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;
