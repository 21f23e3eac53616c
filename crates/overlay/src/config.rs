//! TOML configuration for the overlay service.
//!
//! Every field has a default, so an empty document is valid:
//!
//! ```toml
//! root = "/cloud"
//!
//! [channel]
//! name = "sigil.badges"
//! queue_capacity = 1024
//!
//! [supervisor]
//! watchdog_interval_ms = 20000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sigil_channel::LocalChannelConfig;
use sigil_primitives::BadgePath;
use thiserror::Error;
use uuid::Uuid;

use crate::supervisor::SupervisorConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error reading a configuration file.
	#[error("I/O error reading {path}: {error}")]
	Io {
		/// Path to the file that failed to read.
		path: PathBuf,
		/// The underlying I/O error.
		error: std::io::Error,
	},

	/// The document is not valid TOML or does not match the schema.
	#[error("TOML parse error: {0}")]
	Parse(#[from] toml::de::Error),

	/// A value parsed but is not usable.
	#[error("invalid configuration: {0}")]
	Invalid(String),
}

/// Top-level overlay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverlayConfig {
	/// Scope root; nothing outside it is ever badged.
	pub root: String,
	pub channel: ChannelSection,
	pub supervisor: SupervisorSection,
	pub engine: EngineSection,
}

impl Default for OverlayConfig {
	fn default() -> Self {
		Self {
			root: "/".to_string(),
			channel: ChannelSection::default(),
			supervisor: SupervisorSection::default(),
			engine: EngineSection::default(),
		}
	}
}

/// `[channel]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelSection {
	pub name: String,
	/// Endpoint scope. A fresh one is generated when absent.
	pub scope: Uuid,
	pub queue_capacity: usize,
	pub stale_after_ms: u64,
}

impl Default for ChannelSection {
	fn default() -> Self {
		Self {
			name: "sigil.badges".to_string(),
			scope: Uuid::new_v4(),
			queue_capacity: 1024,
			stale_after_ms: 60_000,
		}
	}
}

/// `[supervisor]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorSection {
	pub poll_interval_ms: u64,
	pub watchdog_interval_ms: u64,
	pub startup_timeout_ms: u64,
	pub kill_retries: u32,
	pub kill_retry_delay_ms: u64,
}

impl Default for SupervisorSection {
	fn default() -> Self {
		Self {
			poll_interval_ms: 1_000,
			watchdog_interval_ms: 20_000,
			startup_timeout_ms: 5_000,
			kill_retries: 10,
			kill_retry_delay_ms: 50,
		}
	}
}

/// `[engine]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSection {
	pub channel_init_timeout_ms: u64,
}

impl Default for EngineSection {
	fn default() -> Self {
		Self {
			channel_init_timeout_ms: 5_000,
		}
	}
}

impl OverlayConfig {
	/// Parses and validates a TOML document.
	pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
		let config: Self = toml::from_str(content)?;
		config.validate()?;
		Ok(config)
	}

	/// Loads configuration from a file.
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
			path: path.to_path_buf(),
			error: e,
		})?;
		Self::from_toml_str(&content)
	}

	/// Rejects values the engine cannot run with.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.root.trim().is_empty() {
			return Err(ConfigError::Invalid("root must not be empty".into()));
		}
		if self.channel.name.is_empty() {
			return Err(ConfigError::Invalid("channel.name must not be empty".into()));
		}
		if self.channel.queue_capacity == 0 {
			return Err(ConfigError::Invalid("channel.queue_capacity must be positive".into()));
		}
		let intervals = [
			("channel.stale_after_ms", self.channel.stale_after_ms),
			("supervisor.poll_interval_ms", self.supervisor.poll_interval_ms),
			("supervisor.watchdog_interval_ms", self.supervisor.watchdog_interval_ms),
			("supervisor.startup_timeout_ms", self.supervisor.startup_timeout_ms),
			("engine.channel_init_timeout_ms", self.engine.channel_init_timeout_ms),
		];
		if let Some((name, _)) = intervals.iter().find(|(_, ms)| *ms == 0) {
			return Err(ConfigError::Invalid(format!("{name} must be positive")));
		}
		if self.supervisor.watchdog_interval_ms <= self.supervisor.poll_interval_ms {
			return Err(ConfigError::Invalid(
				"supervisor.watchdog_interval_ms must exceed supervisor.poll_interval_ms".into(),
			));
		}
		Ok(())
	}

	pub fn root_path(&self) -> BadgePath {
		BadgePath::new(&self.root)
	}

	pub fn supervisor_config(&self) -> SupervisorConfig {
		let s = &self.supervisor;
		SupervisorConfig {
			poll_interval: Duration::from_millis(s.poll_interval_ms),
			watchdog_interval: Duration::from_millis(s.watchdog_interval_ms),
			startup_timeout: Duration::from_millis(s.startup_timeout_ms),
			kill_retries: s.kill_retries,
			kill_retry_delay: Duration::from_millis(s.kill_retry_delay_ms),
		}
	}

	pub fn channel_config(&self) -> LocalChannelConfig {
		LocalChannelConfig {
			queue_capacity: self.channel.queue_capacity,
			stale_after: Duration::from_millis(self.channel.stale_after_ms),
			..LocalChannelConfig::default()
		}
	}

	pub fn engine_config(&self) -> crate::EngineConfig {
		crate::EngineConfig {
			scope: self.root_path(),
			supervisor: self.supervisor_config(),
			channel_init_timeout: Duration::from_millis(self.engine.channel_init_timeout_ms),
		}
	}
}
