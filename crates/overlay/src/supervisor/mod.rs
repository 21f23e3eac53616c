//! Supervised subscription to peer initialization events.
//!
//! A [`SubscriberSupervisor`] owns one channel instance and two threads:
//!
//! * the subscribing worker polls `subscribe(PeerToCore)` with a short
//!   timeout, raising [`SupervisorEvent::PeerInitialized`] per announcement
//!   and refreshing a liveness flag after every normal outcome;
//! * the watchdog wakes every `watchdog_interval` (or when signalled), runs
//!   channel maintenance, and restarts the worker if the liveness flag was not
//!   refreshed since the previous cycle.
//!
//! A failing watchdog cycle raises [`SupervisorEvent::SupervisionFailed`] and
//! exits. The owner is expected to dispose the supervisor and build a new one.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use sigil_channel::{EventSubType, EventType, NotificationChannel, SubscribeOutcome, SubscriberId};
use sigil_worker::{GenerationClock, GenerationToken, TaskClass, WorkerRecord, WorkerRegistry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SupervisorError;

/// Timing for one supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	/// Timeout of each subscribe call made by the worker.
	pub poll_interval: Duration,
	/// Period between watchdog liveness checks.
	pub watchdog_interval: Duration,
	/// How long a start waits for the worker to begin listening.
	pub startup_timeout: Duration,
	/// Exit checks made after cancelling a worker before it is abandoned.
	pub kill_retries: u32,
	pub kill_retry_delay: Duration,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_secs(1),
			watchdog_interval: Duration::from_secs(20),
			startup_timeout: Duration::from_secs(5),
			kill_retries: 10,
			kill_retry_delay: Duration::from_millis(50),
		}
	}
}

/// Signals raised by a supervisor. `supervisor` is the raising instance's id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
	PeerInitialized { supervisor: u64 },
	SupervisionFailed { supervisor: u64, reason: String },
}

/// Lifecycle of the subscribing worker as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
	Idle,
	Subscribing,
	Alive,
	Stalled,
	Cancelled,
	Error,
	Terminated,
}

struct WorkerSlot {
	token: GenerationToken,
	handle: JoinHandle<()>,
}

struct Shared {
	id: u64,
	name: String,
	config: SupervisorConfig,
	channel: Arc<dyn NotificationChannel>,
	subscriber: SubscriberId,
	events: mpsc::UnboundedSender<SupervisorEvent>,
	registry: WorkerRegistry,
	clock: GenerationClock,
	terminated: CancellationToken,
	alive: AtomicBool,
	state: Mutex<SupervisorState>,
	/// Current worker. Held across a whole restart so starts never interleave.
	worker: Mutex<Option<WorkerSlot>>,
	signalled: Mutex<bool>,
	wake: Condvar,
	disposed: AtomicBool,
	#[cfg(test)]
	fail_next_cycle: AtomicBool,
}

impl Shared {
	fn set_state(&self, state: SupervisorState) {
		let mut current = self.state.lock();
		if *current != SupervisorState::Terminated {
			*current = state;
		}
	}

	fn emit(&self, event: SupervisorEvent) {
		if self.events.send(event).is_err() {
			tracing::debug!(supervisor = self.id, "overlay.supervisor.event_dropped");
		}
	}

	fn signal(&self) {
		*self.signalled.lock() = true;
		self.wake.notify_all();
	}
}

/// Watchdog-supervised subscriber for [`EventType::PeerToCore`].
pub struct SubscriberSupervisor {
	shared: Arc<Shared>,
	watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriberSupervisor {
	/// Creates an idle supervisor over an initialized channel.
	///
	/// `name` keys the worker's [`WorkerRecord`] in `registry`.
	pub fn new(
		id: u64,
		name: impl Into<String>,
		config: SupervisorConfig,
		channel: Arc<dyn NotificationChannel>,
		events: mpsc::UnboundedSender<SupervisorEvent>,
		registry: WorkerRegistry,
	) -> Self {
		let name = name.into();
		registry.upsert(WorkerRecord::new(name.clone(), TaskClass::Listener));
		let subscriber = channel.subscriber_id();
		Self {
			shared: Arc::new(Shared {
				id,
				name,
				config,
				channel,
				subscriber,
				events,
				registry,
				clock: GenerationClock::new(),
				terminated: CancellationToken::new(),
				alive: AtomicBool::new(false),
				state: Mutex::new(SupervisorState::Idle),
				worker: Mutex::new(None),
				signalled: Mutex::new(false),
				wake: Condvar::new(),
				disposed: AtomicBool::new(false),
				#[cfg(test)]
				fail_next_cycle: AtomicBool::new(false),
			}),
			watchdog: Mutex::new(None),
		}
	}

	pub fn id(&self) -> u64 {
		self.shared.id
	}

	pub fn subscriber_id(&self) -> SubscriberId {
		self.shared.subscriber
	}

	pub fn state(&self) -> SupervisorState {
		*self.shared.state.lock()
	}

	/// Registry record of the subscribing worker.
	pub fn worker_record(&self) -> Option<WorkerRecord> {
		self.shared.registry.get(&self.shared.name)
	}

	pub fn is_terminated(&self) -> bool {
		self.shared.terminated.is_cancelled()
	}

	/// Starts (or restarts) the subscribing worker and the watchdog.
	///
	/// Returns once the worker has registered its subscription.
	/// [`SupervisorError::StartupTimedOut`] is not fatal; the call may be retried.
	pub fn subscribe_to_initialization_events(&self) -> Result<(), SupervisorError> {
		if self.is_terminated() {
			return Err(SupervisorError::Terminated);
		}
		self.ensure_watchdog()?;
		start_worker(&self.shared)
	}

	/// Wakes the watchdog for an immediate cycle.
	pub fn signal_watchdog(&self) {
		self.shared.signal();
	}

	/// Stops both threads and releases the channel. Idempotent; callable from any thread.
	pub fn dispose(&self) {
		let shared = &self.shared;
		if shared.disposed.swap(true, Ordering::AcqRel) {
			return;
		}
		shared.terminated.cancel();
		shared.signal();

		let worker = shared.worker.lock().take();
		if let Some(slot) = worker {
			kill_worker(shared, slot);
		}
		let watchdog = self.watchdog.lock().take();
		if let Some(handle) = watchdog {
			if handle.thread().id() == std::thread::current().id() {
				drop(handle);
			} else {
				let timeout = shared.config.startup_timeout + shared.config.kill_retry_delay * (shared.config.kill_retries + 1);
				join_bounded(handle, timeout, shared.config.kill_retry_delay, "watchdog");
			}
		}

		shared.channel.terminate();
		*shared.state.lock() = SupervisorState::Terminated;
		tracing::debug!(supervisor = shared.id, "overlay.supervisor.disposed");
	}

	/// Makes the next watchdog cycle panic.
	#[cfg(test)]
	pub(crate) fn fail_next_watchdog_cycle(&self) {
		self.shared.fail_next_cycle.store(true, Ordering::Release);
	}

	fn ensure_watchdog(&self) -> Result<(), SupervisorError> {
		let mut watchdog = self.watchdog.lock();
		if watchdog.is_some() {
			return Ok(());
		}
		let shared = Arc::clone(&self.shared);
		let handle = sigil_worker::spawn_named_thread(TaskClass::Supervision, format!("sigil-watchdog-{}", self.shared.id), move || {
			run_watchdog(&shared)
		})?;
		*watchdog = Some(handle);
		Ok(())
	}
}

impl Drop for SubscriberSupervisor {
	fn drop(&mut self) {
		self.dispose();
	}
}

fn start_worker(shared: &Arc<Shared>) -> Result<(), SupervisorError> {
	let mut slot = shared.worker.lock();
	if shared.terminated.is_cancelled() {
		return Err(SupervisorError::Terminated);
	}
	if let Some(previous) = slot.take() {
		kill_worker(shared, previous);
	}

	let generation = shared.clock.next();
	let token = GenerationToken::child_of(generation, &shared.terminated);
	let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
	shared.set_state(SupervisorState::Subscribing);
	let handle = {
		let shared = Arc::clone(shared);
		let token = token.clone();
		sigil_worker::spawn_named_thread(TaskClass::Listener, format!("sigil-subscriber-{generation}"), move || {
			run_subscriber(&shared, &token, ready_tx)
		})?
	};
	shared.registry.update(&shared.name, TaskClass::Listener, |record| record.generation = generation);

	let timeout = shared.config.startup_timeout;
	match ready_rx.recv_timeout(timeout) {
		Ok(()) => {
			tracing::debug!(supervisor = shared.id, generation, "overlay.supervisor.worker_started");
			*slot = Some(WorkerSlot { token, handle });
			Ok(())
		}
		Err(_) => {
			tracing::warn!(supervisor = shared.id, generation, ?timeout, "overlay.supervisor.startup_timeout");
			kill_worker(shared, WorkerSlot { token, handle });
			Err(SupervisorError::StartupTimedOut { timeout })
		}
	}
}

/// Cancels the worker and waits a bounded time for it to exit.
///
/// Threads cannot be killed, so a worker that never leaves its wait is
/// detached. The cancelled token stops it at its next loop iteration.
fn kill_worker(shared: &Shared, slot: WorkerSlot) {
	let generation = slot.token.generation();
	slot.token.cancel();
	for _ in 0..=shared.config.kill_retries {
		let _ = shared.channel.cancel_waiting_subscription(EventType::PeerToCore, shared.subscriber);
		if slot.handle.is_finished() {
			let _ = slot.handle.join();
			tracing::debug!(supervisor = shared.id, generation, "overlay.supervisor.worker_stopped");
			return;
		}
		std::thread::sleep(shared.config.kill_retry_delay);
	}
	tracing::warn!(supervisor = shared.id, generation, "overlay.supervisor.worker_abandoned");
}

fn join_bounded(handle: JoinHandle<()>, timeout: Duration, step: Duration, what: &'static str) {
	let deadline = Instant::now() + timeout;
	while !handle.is_finished() {
		if Instant::now() >= deadline {
			tracing::warn!(thread = what, "overlay.supervisor.join_abandoned");
			return;
		}
		std::thread::sleep(step);
	}
	let _ = handle.join();
}

fn run_subscriber(shared: &Shared, token: &GenerationToken, ready: std_mpsc::SyncSender<()>) {
	let generation = token.generation();
	// A zero-timeout call registers the subscription before the caller is released.
	let mut outcome = shared.channel.subscribe(EventType::PeerToCore, shared.subscriber, Duration::ZERO);
	let _ = ready.send(());

	let exit = loop {
		if token.is_cancelled() {
			break "cancelled".to_string();
		}
		match outcome {
			SubscribeOutcome::GotEvent(message) => {
				shared.alive.store(true, Ordering::Release);
				shared.set_state(SupervisorState::Alive);
				if message.sub_type == EventSubType::PeerInitialized {
					tracing::debug!(supervisor = shared.id, generation, "overlay.supervisor.peer_initialized");
					shared.emit(SupervisorEvent::PeerInitialized { supervisor: shared.id });
				} else {
					tracing::debug!(supervisor = shared.id, sub_type = ?message.sub_type, "overlay.supervisor.unexpected_event");
				}
			}
			SubscribeOutcome::TimedOut | SubscribeOutcome::TryAgain => {
				shared.alive.store(true, Ordering::Release);
				shared.set_state(SupervisorState::Alive);
			}
			SubscribeOutcome::Cancelled => {
				shared.set_state(SupervisorState::Cancelled);
				break "cancelled".to_string();
			}
			SubscribeOutcome::Error(err) => {
				tracing::warn!(supervisor = shared.id, generation, error = %err, "overlay.supervisor.subscribe_failed");
				shared.set_state(SupervisorState::Error);
				break err.to_string();
			}
		}
		outcome = shared.channel.subscribe(EventType::PeerToCore, shared.subscriber, shared.config.poll_interval);
	};

	tracing::debug!(supervisor = shared.id, generation, exit = %exit, "overlay.supervisor.worker_exit");
	shared.registry.update(&shared.name, TaskClass::Listener, |record| {
		if record.generation == generation {
			record.last_exit = Some(exit);
		}
	});
}

fn run_watchdog(shared: &Arc<Shared>) {
	loop {
		{
			let mut signalled = shared.signalled.lock();
			if !*signalled {
				let _ = shared.wake.wait_for(&mut signalled, shared.config.watchdog_interval);
			}
			*signalled = false;
		}
		if shared.terminated.is_cancelled() {
			break;
		}

		let reason = match std::panic::catch_unwind(AssertUnwindSafe(|| watchdog_cycle(shared))) {
			Ok(Ok(())) => continue,
			Ok(Err(err)) => err.to_string(),
			Err(payload) => sigil_worker::panic_message(payload.as_ref()),
		};
		if shared.terminated.is_cancelled() {
			break;
		}

		tracing::error!(supervisor = shared.id, %reason, "overlay.supervisor.failed");
		let worker = shared.worker.lock().take();
		if let Some(slot) = worker {
			kill_worker(shared, slot);
		}
		shared.set_state(SupervisorState::Error);
		shared.emit(SupervisorEvent::SupervisionFailed {
			supervisor: shared.id,
			reason,
		});
		break;
	}
	tracing::debug!(supervisor = shared.id, "overlay.supervisor.watchdog_exit");
}

fn watchdog_cycle(shared: &Arc<Shared>) -> Result<(), SupervisorError> {
	#[cfg(test)]
	{
		if shared.fail_next_cycle.swap(false, Ordering::AcqRel) {
			panic!("injected watchdog failure");
		}
	}

	if let Err(err) = shared.channel.clean_up_unused_resources() {
		tracing::warn!(supervisor = shared.id, error = %err, "overlay.supervisor.cleanup_failed");
	}
	if shared.alive.swap(false, Ordering::AcqRel) {
		return Ok(());
	}

	tracing::warn!(supervisor = shared.id, "overlay.supervisor.restart");
	shared.set_state(SupervisorState::Stalled);
	shared.registry.update(&shared.name, TaskClass::Listener, |record| record.restarts += 1);
	start_worker(shared)
}

#[cfg(test)]
mod tests;
