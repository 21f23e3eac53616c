use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use sigil_channel::{
	ChannelError, ChannelFactory, ChannelMessage, EventType, LocalChannel, LocalChannelFactory, LocalChannelHub, NotificationChannel,
	Result as ChannelResult, SubscribeOutcome, SubscriberId,
};
use sigil_worker::WorkerRegistry;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::*;
use crate::test_support::{init_tracing, wait_for};

fn fast_config() -> SupervisorConfig {
	SupervisorConfig {
		poll_interval: Duration::from_millis(20),
		watchdog_interval: Duration::from_millis(150),
		startup_timeout: Duration::from_millis(500),
		kill_retries: 10,
		kill_retry_delay: Duration::from_millis(10),
	}
}

fn recv_within(rx: &mut mpsc::UnboundedReceiver<SupervisorEvent>, timeout: Duration) -> Option<SupervisorEvent> {
	let mut event = None;
	wait_for(timeout, || {
		event = rx.try_recv().ok();
		event.is_some()
	});
	event
}

#[derive(Default)]
struct Gate {
	stall_next: bool,
	stalled: bool,
	released: bool,
}

/// Wraps a [`LocalChannel`]; an armed subscribe call blocks until cancelled.
struct GatedChannel {
	inner: LocalChannel,
	gate: Mutex<Gate>,
	cv: Condvar,
}

impl GatedChannel {
	fn new(inner: LocalChannel) -> Arc<Self> {
		Arc::new(Self {
			inner,
			gate: Mutex::new(Gate::default()),
			cv: Condvar::new(),
		})
	}

	fn stall_next_subscribe(&self) {
		self.gate.lock().stall_next = true;
	}

	fn is_stalled(&self) -> bool {
		self.gate.lock().stalled
	}
}

impl NotificationChannel for GatedChannel {
	fn subscriber_id(&self) -> SubscriberId {
		self.inner.subscriber_id()
	}

	fn initialize(&self) -> ChannelResult<()> {
		self.inner.initialize()
	}

	fn publish(&self, message: &ChannelMessage) -> ChannelResult<()> {
		self.inner.publish(message)
	}

	fn subscribe(&self, event: EventType, subscriber: SubscriberId, timeout: Duration) -> SubscribeOutcome {
		let mut gate = self.gate.lock();
		if std::mem::take(&mut gate.stall_next) {
			gate.stalled = true;
			gate.released = false;
			let deadline = Instant::now() + Duration::from_secs(10);
			while !gate.released && Instant::now() < deadline {
				self.cv.wait_until(&mut gate, deadline);
			}
			gate.stalled = false;
			return SubscribeOutcome::Cancelled;
		}
		drop(gate);
		self.inner.subscribe(event, subscriber, timeout)
	}

	fn cancel_waiting_subscription(&self, event: EventType, subscriber: SubscriberId) -> ChannelResult<()> {
		{
			let mut gate = self.gate.lock();
			if gate.stalled {
				gate.released = true;
				self.cv.notify_all();
			}
		}
		self.inner.cancel_waiting_subscription(event, subscriber)
	}

	fn clean_up_unused_resources(&self) -> ChannelResult<usize> {
		self.inner.clean_up_unused_resources()
	}

	fn terminate(&self) {
		self.inner.terminate()
	}
}

/// Wraps a [`LocalChannel`]; an armed subscribe call fails once, and
/// maintenance calls are counted.
struct FlakyChannel {
	inner: LocalChannel,
	fail_next: AtomicBool,
	cleanups: AtomicUsize,
}

impl FlakyChannel {
	fn new(inner: LocalChannel) -> Arc<Self> {
		Arc::new(Self {
			inner,
			fail_next: AtomicBool::new(false),
			cleanups: AtomicUsize::new(0),
		})
	}

	fn fail_next_subscribe(&self) {
		self.fail_next.store(true, Ordering::Release);
	}

	fn cleanups(&self) -> usize {
		self.cleanups.load(Ordering::Acquire)
	}
}

impl NotificationChannel for FlakyChannel {
	fn subscriber_id(&self) -> SubscriberId {
		self.inner.subscriber_id()
	}

	fn initialize(&self) -> ChannelResult<()> {
		self.inner.initialize()
	}

	fn publish(&self, message: &ChannelMessage) -> ChannelResult<()> {
		self.inner.publish(message)
	}

	fn subscribe(&self, event: EventType, subscriber: SubscriberId, timeout: Duration) -> SubscribeOutcome {
		if self.fail_next.swap(false, Ordering::AcqRel) {
			return SubscribeOutcome::Error(ChannelError::Terminated);
		}
		self.inner.subscribe(event, subscriber, timeout)
	}

	fn cancel_waiting_subscription(&self, event: EventType, subscriber: SubscriberId) -> ChannelResult<()> {
		self.inner.cancel_waiting_subscription(event, subscriber)
	}

	fn clean_up_unused_resources(&self) -> ChannelResult<usize> {
		self.cleanups.fetch_add(1, Ordering::AcqRel);
		self.inner.clean_up_unused_resources()
	}

	fn terminate(&self) {
		self.inner.terminate()
	}
}

struct Fixture {
	factory: LocalChannelFactory,
	registry: WorkerRegistry,
	events: mpsc::UnboundedReceiver<SupervisorEvent>,
	tx: mpsc::UnboundedSender<SupervisorEvent>,
}

impl Fixture {
	fn new() -> Self {
		init_tracing();
		let (tx, events) = mpsc::unbounded_channel();
		Self {
			factory: LocalChannelFactory::new(LocalChannelHub::new(), "sigil.test", Uuid::new_v4()),
			registry: WorkerRegistry::new(),
			events,
			tx,
		}
	}

	fn supervisor(&self, channel: Arc<dyn NotificationChannel>) -> SubscriberSupervisor {
		SubscriberSupervisor::new(7, "overlay.subscriber", fast_config(), channel, self.tx.clone(), self.registry.clone())
	}

	fn peer(&self) -> LocalChannel {
		self.factory.open_local().expect("peer channel opens")
	}
}

#[test]
fn peer_announcement_raises_event() {
	let mut fx = Fixture::new();
	let supervisor = fx.supervisor(fx.factory.open().expect("channel opens"));
	supervisor.subscribe_to_initialization_events().expect("worker starts");

	fx.peer().publish(&ChannelMessage::peer_initialized()).expect("publish");
	assert_eq!(
		recv_within(&mut fx.events, Duration::from_secs(5)),
		Some(SupervisorEvent::PeerInitialized { supervisor: 7 })
	);
	assert!(wait_for(Duration::from_secs(1), || supervisor.state() == SupervisorState::Alive));
	assert_eq!(supervisor.worker_record().map(|r| r.generation), Some(1));
}

#[test]
fn stalled_worker_is_restarted() {
	let mut fx = Fixture::new();
	let channel = GatedChannel::new(fx.peer());
	let supervisor = fx.supervisor(channel.clone());
	supervisor.subscribe_to_initialization_events().expect("worker starts");

	channel.stall_next_subscribe();
	assert!(wait_for(Duration::from_secs(2), || channel.is_stalled()));
	assert!(wait_for(Duration::from_secs(5), || {
		supervisor.worker_record().is_some_and(|r| r.restarts >= 1 && r.generation >= 2)
	}));
	assert!(!channel.is_stalled());

	fx.peer().publish(&ChannelMessage::peer_initialized()).expect("publish");
	assert_eq!(
		recv_within(&mut fx.events, Duration::from_secs(5)),
		Some(SupervisorEvent::PeerInitialized { supervisor: 7 })
	);
}

#[test]
fn failed_subscribe_ends_worker_and_watchdog_restarts_it() {
	let mut fx = Fixture::new();
	let channel = FlakyChannel::new(fx.peer());
	let supervisor = fx.supervisor(channel.clone());
	supervisor.subscribe_to_initialization_events().expect("worker starts");

	channel.fail_next_subscribe();
	assert!(wait_for(Duration::from_secs(2), || {
		supervisor.worker_record().and_then(|r| r.last_exit).as_deref() == Some("channel terminated")
	}));
	assert!(wait_for(Duration::from_secs(5), || {
		supervisor.worker_record().is_some_and(|r| r.restarts >= 1 && r.generation >= 2)
	}));
	assert!(channel.cleanups() >= 1);

	fx.peer().publish(&ChannelMessage::peer_initialized()).expect("publish");
	assert_eq!(
		recv_within(&mut fx.events, Duration::from_secs(5)),
		Some(SupervisorEvent::PeerInitialized { supervisor: 7 })
	);
}

#[test]
fn watchdog_runs_maintenance_on_every_wake() {
	let fx = Fixture::new();
	let channel = FlakyChannel::new(fx.peer());
	let supervisor = fx.supervisor(channel.clone());
	supervisor.subscribe_to_initialization_events().expect("worker starts");

	let before = channel.cleanups();
	supervisor.signal_watchdog();
	assert!(wait_for(Duration::from_secs(2), || channel.cleanups() > before));
	let after_signal = channel.cleanups();
	assert!(wait_for(Duration::from_secs(2), || channel.cleanups() > after_signal));
}

#[test]
fn startup_timeout_is_reported_and_retryable() {
	let fx = Fixture::new();
	let channel = GatedChannel::new(fx.peer());
	let supervisor = fx.supervisor(channel.clone());

	channel.stall_next_subscribe();
	let err = supervisor.subscribe_to_initialization_events().expect_err("first subscribe wedges");
	assert!(matches!(err, SupervisorError::StartupTimedOut { .. }));
	assert!(!channel.is_stalled());

	supervisor.subscribe_to_initialization_events().expect("retry starts");
	assert!(supervisor.worker_record().is_some_and(|r| r.generation >= 2));
}

#[test]
fn watchdog_failure_escalates() {
	let mut fx = Fixture::new();
	let supervisor = fx.supervisor(fx.factory.open().expect("channel opens"));
	supervisor.subscribe_to_initialization_events().expect("worker starts");

	supervisor.fail_next_watchdog_cycle();
	supervisor.signal_watchdog();
	match recv_within(&mut fx.events, Duration::from_secs(5)) {
		Some(SupervisorEvent::SupervisionFailed { supervisor: 7, reason }) => {
			assert!(reason.contains("injected watchdog failure"), "{reason}");
		}
		other => panic!("expected supervision failure, got {other:?}"),
	}
	assert_eq!(supervisor.state(), SupervisorState::Error);
	assert!(supervisor.worker_record().and_then(|r| r.last_exit).is_some());
}

#[test]
fn dispose_is_idempotent_and_releases_channel() {
	let fx = Fixture::new();
	let channel = fx.factory.open().expect("channel opens");
	let supervisor = fx.supervisor(Arc::clone(&channel));
	supervisor.subscribe_to_initialization_events().expect("worker starts");

	supervisor.dispose();
	supervisor.dispose();
	assert_eq!(supervisor.state(), SupervisorState::Terminated);
	assert!(supervisor.is_terminated());
	assert!(matches!(
		supervisor.subscribe_to_initialization_events(),
		Err(SupervisorError::Terminated)
	));
	assert!(channel.publish(&ChannelMessage::peer_initialized()).is_err());
}

#[test]
fn dispose_from_another_thread() {
	let fx = Fixture::new();
	let supervisor = Arc::new(fx.supervisor(fx.factory.open().expect("channel opens")));
	supervisor.subscribe_to_initialization_events().expect("worker starts");

	let remote = Arc::clone(&supervisor);
	std::thread::spawn(move || remote.dispose()).join().expect("dispose thread");
	assert_eq!(supervisor.state(), SupervisorState::Terminated);
	assert_eq!(supervisor.worker_record().and_then(|r| r.last_exit), Some("cancelled".to_string()));
}
