use std::time::Duration;

use sigil_channel::ChannelError;
use sigil_primitives::BadgePath;
use thiserror::Error;

pub use crate::store::RenameError;

/// Errors surfaced by [`crate::BadgeStateEngine`] operations.
///
/// Transport failures during normal operation are logged and never reach the
/// caller; [`EngineError::Channel`] only appears while the engine starts.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("{path} is outside the badge scope {scope}")]
	OutOfScope { path: BadgePath, scope: BadgePath },

	#[error(transparent)]
	Store(#[from] RenameError),

	#[error("failed to open notification channel: {0}")]
	Channel(#[from] ChannelError),

	#[error("notification channel did not initialize within {0:?}")]
	ChannelInitTimedOut(Duration),

	#[error("notification channel init thread exited without reporting")]
	ChannelInitThreadLost,

	#[error("failed to start peer supervision: {0}")]
	Supervisor(#[from] SupervisorError),

	#[error("failed to spawn engine thread: {0}")]
	Spawn(#[source] std::io::Error),

	#[error("engine is shut down")]
	ShutDown,
}

/// Errors from [`crate::SubscriberSupervisor`].
#[derive(Debug, Error)]
pub enum SupervisorError {
	#[error("subscriber did not start listening within {timeout:?}")]
	StartupTimedOut { timeout: Duration },

	#[error("supervisor is terminated")]
	Terminated,

	#[error("failed to spawn supervisor thread: {0}")]
	Spawn(#[from] std::io::Error),

	#[error(transparent)]
	Channel(#[from] ChannelError),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
