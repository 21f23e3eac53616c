//! Hierarchical badge-state engine with supervised peer synchronization.
//!
//! * [`store`]: case-insensitive badge tree with structural remove/rename callbacks
//! * [`engine`]: effective-badge resolution, snapshot diffing and peer resync
//! * [`supervisor`]: subscribing worker plus watchdog that restarts it when it stalls
//! * [`queue`]: FIFO request queue applied by an on-demand drain task
//! * [`peer`]: subscriber-side mirror of the protocol
//! * [`service`]: process-wide context bundling engine and queue
//! * [`config`]: TOML configuration

pub mod config;
pub mod engine;
pub mod error;
pub mod peer;
pub mod queue;
pub mod service;
pub mod store;
pub mod supervisor;
#[cfg(test)]
mod test_support;

pub use config::{ConfigError, OverlayConfig};
pub use engine::{BadgeStateEngine, EngineConfig, effective_badge};
pub use error::{EngineError, Result, SupervisorError};
pub use peer::PeerMirror;
pub use queue::{BadgeRequest, BadgeRequestQueue, ChangeDirection, ChangeKind, FileChange};
pub use service::OverlayService;
pub use store::{BadgeStore, RenameError, TreeSnapshot};
pub use supervisor::{SubscriberSupervisor, SupervisorConfig, SupervisorEvent, SupervisorState};
