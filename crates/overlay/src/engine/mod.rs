//! Badge state engine.
//!
//! The engine owns the [`BadgeStore`] and a flat snapshot of what peers were
//! last told. Every public operation takes the state lock once, mutates the
//! store, then recomputes the effective badge of each affected path and
//! publishes the difference against the snapshot. Publishing happens under
//! the same lock, so a peer resync never interleaves with a mutation.
//!
//! Transport failures are logged and never roll back the store; peers
//! converge on the next resync.

mod effective;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use sigil_channel::{ChannelFactory, ChannelMessage, EventSubType, NotificationChannel};
use sigil_primitives::{BadgePath, BadgeState};
use sigil_worker::{GenerationClock, TaskClass, WorkerRecord, WorkerRegistry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use self::effective::effective_badge;
use crate::error::{EngineError, Result, SupervisorError};
use crate::store::{BadgeStore, RenameError};
use crate::supervisor::{SubscriberSupervisor, SupervisorConfig, SupervisorEvent};

const SUBSCRIBER_WORKER: &str = "overlay.subscriber";

/// Startup parameters for a supervised engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
	pub scope: BadgePath,
	pub supervisor: SupervisorConfig,
	/// Bound on opening the publishing channel.
	pub channel_init_timeout: Duration,
}

impl EngineConfig {
	pub fn new(scope: BadgePath) -> Self {
		Self {
			scope,
			supervisor: SupervisorConfig::default(),
			channel_init_timeout: Duration::from_secs(5),
		}
	}
}

struct EngineState {
	store: BadgeStore,
	/// Last state announced to peers per path. Never holds `None`.
	current: HashMap<BadgePath, BadgeState>,
}

struct Supervision {
	factory: Arc<dyn ChannelFactory>,
	config: SupervisorConfig,
	events: mpsc::UnboundedSender<SupervisorEvent>,
	ids: GenerationClock,
	current: Mutex<Option<SubscriberSupervisor>>,
}

struct EngineInner {
	scope: BadgePath,
	state: Mutex<EngineState>,
	publisher: Arc<dyn NotificationChannel>,
	supervision: Option<Supervision>,
	registry: WorkerRegistry,
	shutdown: CancellationToken,
	closed: AtomicBool,
}

/// Cloneable handle to one badge engine.
#[derive(Clone)]
pub struct BadgeStateEngine {
	inner: Arc<EngineInner>,
}

impl BadgeStateEngine {
	/// Creates an engine publishing on `publisher`, without peer supervision.
	///
	/// Peer resyncs must be driven through [`Self::on_peer_initialized`].
	pub fn new(scope: BadgePath, publisher: Arc<dyn NotificationChannel>) -> Self {
		Self {
			inner: Arc::new(EngineInner::new(scope, publisher, None)),
		}
	}

	/// Opens the publishing channel, seeds `initial`, and starts peer supervision.
	///
	/// Failing to open a channel is fatal. A supervisor that does not confirm
	/// startup in time is only logged; its watchdog keeps retrying.
	pub fn start(config: EngineConfig, factory: Arc<dyn ChannelFactory>, initial: impl IntoIterator<Item = (BadgePath, BadgeState)>) -> Result<Self> {
		let publisher = open_channel(&factory, config.channel_init_timeout)?;
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		let supervision = Supervision {
			factory,
			config: config.supervisor,
			events: events_tx,
			ids: GenerationClock::new(),
			current: Mutex::new(None),
		};
		let engine = Self {
			inner: Arc::new(EngineInner::new(config.scope, publisher, Some(supervision))),
		};

		let mut seeded = 0usize;
		for (path, state) in initial {
			match engine.set_badge(&path, state) {
				Ok(()) => seeded += 1,
				Err(err) => tracing::warn!(path = %path, error = %err, "overlay.engine.seed_skipped"),
			}
		}

		spawn_event_pump(Arc::downgrade(&engine.inner), engine.inner.shutdown.clone(), events_rx);
		if let Some(supervision) = &engine.inner.supervision {
			let supervisor = engine.inner.spawn_supervisor(supervision)?;
			*supervision.current.lock() = Some(supervisor);
		}
		tracing::info!(scope = %engine.inner.scope, seeded, "overlay.engine.started");
		Ok(engine)
	}

	pub fn scope(&self) -> &BadgePath {
		&self.inner.scope
	}

	/// Stores `state` at `path` (`None` stores absence) and republishes what changed.
	pub fn set_badge(&self, path: &BadgePath, state: BadgeState) -> Result<()> {
		self.inner.check_in_scope(path)?;
		let mut st = self.inner.lock()?;
		self.inner.set_badge_locked(&mut st, path, state);
		Ok(())
	}

	/// Removes `path` and its subtree. A pending delete leaves `path` showing `Syncing`.
	///
	/// Returns whether `path` was present.
	pub fn delete_badge_path(&self, path: &BadgePath, pending: bool) -> Result<bool> {
		self.inner.check_in_scope(path)?;
		let mut st = self.inner.lock()?;
		Ok(self.inner.delete_badge_path_locked(&mut st, path, pending))
	}

	/// Moves the subtree at `from` to `to`.
	///
	/// Moving out of the scope deletes; moving in only recomputes `to`. A
	/// failed native store rename is recovered by replaying the subtree.
	pub fn rename_badge_path(&self, from: &BadgePath, to: &BadgePath) -> Result<()> {
		let scope = &self.inner.scope;
		let (from_in, to_in) = (from.starts_with(scope), to.starts_with(scope));
		let mut st = self.inner.lock()?;
		match (from_in, to_in) {
			(false, false) => Err(EngineError::OutOfScope {
				path: from.clone(),
				scope: scope.clone(),
			}),
			(true, false) => {
				tracing::debug!(from = %from, to = %to, "overlay.engine.rename_out_of_scope");
				self.inner.delete_badge_path_locked(&mut st, from, false);
				Ok(())
			}
			(false, true) => {
				self.inner.update_ancestors(&mut st, to);
				self.inner.update_badge_state_at_path(&mut st, to);
				Ok(())
			}
			(true, true) => self.inner.rename_badge_path_locked(&mut st, from, to),
		}
	}

	/// Effective badge of `path`. Paths outside the scope are always `None`.
	pub fn find_effective_badge(&self, path: &BadgePath) -> BadgeState {
		let st = self.inner.state.lock();
		effective_badge(&st.store, &self.inner.scope, path)
	}

	/// Resends the whole scope: remove and re-add the scope root, then every
	/// snapshot entry.
	pub fn on_peer_initialized(&self) {
		self.inner.on_peer_initialized();
	}

	/// Rebuilds peer supervision with a fresh channel identity, then resyncs.
	///
	/// Failures reported by a supervisor that was already replaced are ignored.
	pub fn on_supervision_failed(&self, supervisor: u64, reason: &str) {
		self.inner.on_supervision_failed(supervisor, reason);
	}

	/// Snapshot of what peers were last told, sorted by path.
	pub fn snapshot(&self) -> Vec<(BadgePath, BadgeState)> {
		let st = self.inner.state.lock();
		let mut entries: Vec<_> = st.current.iter().map(|(path, state)| (path.clone(), *state)).collect();
		entries.sort_by(|a, b| a.0.cmp(&b.0));
		entries
	}

	/// Explicit values held by the store, in key order.
	pub fn stored_badges(&self) -> Vec<(BadgePath, BadgeState)> {
		self.inner.state.lock().store.entries()
	}

	/// Id of the live supervisor, if supervision runs.
	pub fn supervisor_id(&self) -> Option<u64> {
		let supervision = self.inner.supervision.as_ref()?;
		supervision.current.lock().as_ref().map(SubscriberSupervisor::id)
	}

	/// Status of supervised workers.
	pub fn worker_records(&self) -> Vec<WorkerRecord> {
		self.inner.registry.snapshots()
	}

	pub fn is_shut_down(&self) -> bool {
		self.inner.closed.load(Ordering::Acquire)
	}

	/// Stops supervision and releases the publishing channel. Idempotent.
	pub fn shutdown(&self) {
		self.inner.shutdown();
	}

	#[cfg(test)]
	pub(crate) fn fail_next_store_rename(&self) {
		self.inner.state.lock().store.fail_next_rename();
	}

	/// Makes the live supervisor's next watchdog cycle fail, and wakes it.
	#[cfg(test)]
	pub(crate) fn fail_supervisor_watchdog(&self) {
		if let Some(supervision) = &self.inner.supervision
			&& let Some(supervisor) = supervision.current.lock().as_ref()
		{
			supervisor.fail_next_watchdog_cycle();
			supervisor.signal_watchdog();
		}
	}
}

impl EngineInner {
	fn new(scope: BadgePath, publisher: Arc<dyn NotificationChannel>, supervision: Option<Supervision>) -> Self {
		Self {
			scope,
			state: Mutex::new(EngineState {
				store: BadgeStore::new(),
				current: HashMap::new(),
			}),
			publisher,
			supervision,
			registry: WorkerRegistry::new(),
			shutdown: CancellationToken::new(),
			closed: AtomicBool::new(false),
		}
	}

	fn lock(&self) -> Result<parking_lot::MutexGuard<'_, EngineState>> {
		if self.closed.load(Ordering::Acquire) {
			return Err(EngineError::ShutDown);
		}
		Ok(self.state.lock())
	}

	fn check_in_scope(&self, path: &BadgePath) -> Result<()> {
		if path.starts_with(&self.scope) {
			Ok(())
		} else {
			Err(EngineError::OutOfScope {
				path: path.clone(),
				scope: self.scope.clone(),
			})
		}
	}

	fn set_badge_locked(&self, st: &mut EngineState, path: &BadgePath, state: BadgeState) {
		let previous = st.store.try_get(path);
		// Entering or leaving selective changes what every descendant resolves to.
		let subtree = if state == BadgeState::SyncSelective || previous == Some(BadgeState::SyncSelective) {
			st.store.extract_subtree(path)
		} else {
			None
		};

		st.store.set(path, (!state.is_none()).then_some(state));
		tracing::debug!(path = %path, state = %state, "overlay.engine.set");

		self.update_ancestors(st, path);
		self.update_badge_state_at_path(st, path);
		if let Some(subtree) = subtree {
			for (descendant, _) in subtree.descendants_postorder() {
				self.update_badge_state_at_path(st, &descendant);
			}
		}
	}

	fn delete_badge_path_locked(&self, st: &mut EngineState, path: &BadgePath, pending: bool) -> bool {
		let EngineState { store, current } = st;
		let removed = store.remove(path, |node| self.erase(current, node.path));
		if pending {
			store.set(path, Some(BadgeState::Syncing));
		} else {
			self.erase(current, path);
		}
		tracing::debug!(path = %path, pending, removed, "overlay.engine.delete");

		self.update_ancestors(st, path);
		self.update_badge_state_at_path(st, path);
		removed
	}

	fn rename_badge_path_locked(&self, st: &mut EngineState, from: &BadgePath, to: &BadgePath) -> Result<()> {
		let EngineState { store, current } = st;
		match store.rename(from, to, |node| self.erase(current, node.old_path)) {
			Ok(()) => {}
			Err(err @ (RenameError::SourceMissing(_) | RenameError::RootNotMovable)) => return Err(err.into()),
			Err(err) => {
				tracing::warn!(from = %from, to = %to, error = %err, "overlay.engine.rename_fallback");
				let Some(subtree) = store.extract_subtree(from) else {
					return Err(err.into());
				};
				store.remove(from, |node| self.erase(current, node.path));
				self.erase(current, from);
				for (old, value) in subtree.entries_postorder() {
					if let Some(new) = old.rebase(from, to) {
						store.set(&new, value);
					}
				}
			}
		}
		tracing::debug!(from = %from, to = %to, "overlay.engine.rename");

		if let Some(moved) = st.store.extract_subtree(to) {
			for (path, _) in moved.entries_postorder() {
				self.update_badge_state_at_path(st, &path);
			}
		}
		self.update_ancestors(st, to);
		self.update_badge_state_at_path(st, from);
		self.update_ancestors(st, from);
		Ok(())
	}

	/// Recomputes every ancestor strictly inside the scope, nearest first.
	fn update_ancestors(&self, st: &mut EngineState, path: &BadgePath) {
		for ancestor in path.ancestors().take_while(|ancestor| ancestor.is_descendant_of(&self.scope)) {
			self.update_badge_state_at_path(st, &ancestor);
		}
	}

	/// Publishes the difference between `path`'s effective badge and the snapshot.
	///
	/// The scope root is announced through scope-root events only.
	fn update_badge_state_at_path(&self, st: &mut EngineState, path: &BadgePath) {
		if *path == self.scope {
			return;
		}
		let next = effective_badge(&st.store, &self.scope, path);
		let previous = st.current.get(path).copied();
		if previous == Some(next) || (previous.is_none() && next.is_none()) {
			return;
		}
		if previous.is_some() {
			self.publish(EventSubType::RemoveBadgePath, BadgeState::None, path);
		}
		if next.is_none() {
			st.current.remove(path);
		} else {
			self.publish(EventSubType::AddBadgePath, next, path);
			st.current.insert(path.clone(), next);
		}
	}

	/// Drops `path` from the snapshot, telling peers if it was announced.
	fn erase(&self, current: &mut HashMap<BadgePath, BadgeState>, path: &BadgePath) {
		if current.remove(path).is_some() {
			self.publish(EventSubType::RemoveBadgePath, BadgeState::None, path);
		}
	}

	fn publish(&self, sub_type: EventSubType, state: BadgeState, path: &BadgePath) {
		let message = ChannelMessage::core(sub_type, state, path);
		match self.publisher.publish(&message) {
			Ok(()) => tracing::trace!(sub_type = ?sub_type, state = %state, path = %path, "overlay.engine.publish"),
			Err(err) => tracing::warn!(sub_type = ?sub_type, path = %path, error = %err, "overlay.engine.publish_failed"),
		}
	}

	fn on_peer_initialized(&self) {
		let st = self.state.lock();
		if self.closed.load(Ordering::Acquire) {
			return;
		}
		self.publish(EventSubType::RemoveScopeRoot, BadgeState::None, &self.scope);
		self.publish(EventSubType::AddScopeRoot, BadgeState::None, &self.scope);
		for (path, state) in &st.current {
			self.publish(EventSubType::AddBadgePath, *state, path);
		}
		tracing::info!(scope = %self.scope, entries = st.current.len(), "overlay.engine.resync");
	}

	fn on_supervision_failed(&self, supervisor: u64, reason: &str) {
		let Some(supervision) = &self.supervision else {
			return;
		};
		{
			let mut current = supervision.current.lock();
			if self.closed.load(Ordering::Acquire) || current.as_ref().map(SubscriberSupervisor::id) != Some(supervisor) {
				tracing::debug!(supervisor, "overlay.engine.stale_supervision_failure");
				return;
			}
			tracing::error!(supervisor, reason, "overlay.engine.supervision_failed");
			if let Some(old) = current.take() {
				old.dispose();
			}
			match self.spawn_supervisor(supervision) {
				Ok(replacement) => {
					tracing::info!(supervisor = replacement.id(), "overlay.engine.supervisor_rebuilt");
					*current = Some(replacement);
				}
				Err(err) => tracing::error!(error = %err, "overlay.engine.supervisor_rebuild_failed"),
			}
		}
		self.on_peer_initialized();
	}

	fn spawn_supervisor(&self, supervision: &Supervision) -> Result<SubscriberSupervisor> {
		let channel = supervision.factory.open()?;
		let supervisor = SubscriberSupervisor::new(
			supervision.ids.next(),
			SUBSCRIBER_WORKER,
			supervision.config.clone(),
			channel,
			supervision.events.clone(),
			self.registry.clone(),
		);
		match supervisor.subscribe_to_initialization_events() {
			Ok(()) => Ok(supervisor),
			Err(SupervisorError::StartupTimedOut { timeout }) => {
				tracing::warn!(supervisor = supervisor.id(), ?timeout, "overlay.engine.supervisor_slow_start");
				Ok(supervisor)
			}
			Err(err) => {
				supervisor.dispose();
				Err(err.into())
			}
		}
	}

	fn handle_supervisor_event(&self, event: SupervisorEvent) {
		match event {
			SupervisorEvent::PeerInitialized { supervisor } => {
				tracing::debug!(supervisor, "overlay.engine.peer_initialized");
				self.on_peer_initialized();
			}
			SupervisorEvent::SupervisionFailed { supervisor, reason } => self.on_supervision_failed(supervisor, &reason),
		}
	}

	fn shutdown(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.shutdown.cancel();
		if let Some(supervision) = &self.supervision {
			let current = supervision.current.lock().take();
			if let Some(supervisor) = current {
				supervisor.dispose();
			}
		}
		self.publisher.terminate();
		tracing::info!(scope = %self.scope, "overlay.engine.shutdown");
	}
}

impl Drop for EngineInner {
	fn drop(&mut self) {
		self.shutdown();
	}
}

/// Opens one channel on a dedicated thread, waiting at most `timeout`.
fn open_channel(factory: &Arc<dyn ChannelFactory>, timeout: Duration) -> Result<Arc<dyn NotificationChannel>> {
	let (tx, rx) = std_mpsc::sync_channel(1);
	let factory = Arc::clone(factory);
	sigil_worker::spawn_named_thread(TaskClass::Listener, "sigil-channel-init", move || {
		let _ = tx.send(factory.open());
	})
	.map_err(EngineError::Spawn)?;

	match rx.recv_timeout(timeout) {
		Ok(opened) => Ok(opened?),
		Err(std_mpsc::RecvTimeoutError::Timeout) => Err(EngineError::ChannelInitTimedOut(timeout)),
		Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(EngineError::ChannelInitThreadLost),
	}
}

/// Forwards supervisor events to the engine until shutdown or engine drop.
fn spawn_event_pump(engine: Weak<EngineInner>, shutdown: CancellationToken, mut events: mpsc::UnboundedReceiver<SupervisorEvent>) {
	let _ = sigil_worker::spawn(TaskClass::Pump, async move {
		loop {
			let event = tokio::select! {
				biased;
				_ = shutdown.cancelled() => break,
				event = events.recv() => event,
			};
			let Some(event) = event else {
				break;
			};
			let Some(inner) = engine.upgrade() else {
				break;
			};
			if let Err(err) = sigil_worker::spawn_blocking(TaskClass::Supervision, move || inner.handle_supervisor_event(event)).await {
				tracing::error!(error = %err, "overlay.engine.event_handler_failed");
			}
		}
		tracing::debug!("overlay.engine.pump_exit");
	});
}

#[cfg(test)]
mod tests;
