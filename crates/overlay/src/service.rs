//! Process-wide overlay context.

use std::sync::Arc;
use std::time::Duration;

use sigil_channel::{ChannelFactory, LocalChannelFactory, LocalChannelHub};
use sigil_primitives::{BadgePath, BadgeState};

use crate::config::OverlayConfig;
use crate::engine::BadgeStateEngine;
use crate::error::Result;
use crate::queue::BadgeRequestQueue;

/// The engine plus the request queue feeding it.
///
/// Built once at startup and handed to collaborators as `Arc<OverlayService>`.
pub struct OverlayService {
	engine: BadgeStateEngine,
	queue: BadgeRequestQueue,
}

impl OverlayService {
	/// Starts a supervised engine on channels from `factory`.
	pub fn start(config: &OverlayConfig, factory: Arc<dyn ChannelFactory>, initial: impl IntoIterator<Item = (BadgePath, BadgeState)>) -> Result<Arc<Self>> {
		let engine = BadgeStateEngine::start(config.engine_config(), factory, initial)?;
		let queue = BadgeRequestQueue::new(engine.clone());
		Ok(Arc::new(Self { engine, queue }))
	}

	/// Starts on a fresh in-process hub configured from `config`.
	///
	/// Returns the factory too, so in-process peers can join the same endpoint.
	pub fn start_local(config: &OverlayConfig) -> Result<(Arc<Self>, Arc<LocalChannelFactory>)> {
		let hub = LocalChannelHub::with_config(config.channel_config());
		let factory = Arc::new(LocalChannelFactory::new(hub, config.channel.name.clone(), config.channel.scope));
		let service = Self::start(config, factory.clone(), [])?;
		Ok((service, factory))
	}

	pub fn engine(&self) -> &BadgeStateEngine {
		&self.engine
	}

	pub fn queue(&self) -> &BadgeRequestQueue {
		&self.queue
	}

	/// Read-only query path for shell integrations.
	pub fn find_effective_badge(&self, path: &BadgePath) -> BadgeState {
		self.engine.find_effective_badge(path)
	}

	/// Closes the queue, lets it drain for up to `drain_timeout`, then stops the engine.
	///
	/// Returns `false` if requests were still pending when the engine stopped.
	pub fn shutdown(&self, drain_timeout: Duration) -> bool {
		self.queue.close();
		let drained = self.queue.wait_idle(drain_timeout);
		if !drained {
			tracing::warn!(pending = self.queue.len(), "overlay.service.drain_timeout");
		}
		self.engine.shutdown();
		drained
	}
}
