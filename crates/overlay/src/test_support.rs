//! Channel doubles shared by unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use sigil_channel::{
	ChannelError, ChannelFactory, ChannelMessage, EventSubType, EventType, NotificationChannel, Result as ChannelResult, SubscribeOutcome, SubscriberId,
};
use sigil_primitives::BadgeState;

/// Captures every published message. Subscribes always time out.
pub(crate) struct RecordingChannel {
	subscriber: SubscriberId,
	published: Mutex<Vec<ChannelMessage>>,
	fail_publish: AtomicBool,
	terminated: AtomicBool,
}

impl RecordingChannel {
	pub(crate) fn new() -> Arc<Self> {
		Arc::new(Self {
			subscriber: SubscriberId::new(),
			published: Mutex::new(Vec::new()),
			fail_publish: AtomicBool::new(false),
			terminated: AtomicBool::new(false),
		})
	}

	/// Drains everything recorded so far.
	pub(crate) fn take(&self) -> Vec<ChannelMessage> {
		std::mem::take(&mut *self.published.lock())
	}

	/// Drains and summarizes everything recorded so far.
	pub(crate) fn take_notes(&self) -> Vec<Note> {
		notes(&self.take())
	}

	pub(crate) fn messages(&self) -> Vec<ChannelMessage> {
		self.published.lock().clone()
	}

	pub(crate) fn set_fail_publish(&self, fail: bool) {
		self.fail_publish.store(fail, Ordering::Release);
	}

	pub(crate) fn is_terminated(&self) -> bool {
		self.terminated.load(Ordering::Acquire)
	}
}

impl NotificationChannel for RecordingChannel {
	fn subscriber_id(&self) -> SubscriberId {
		self.subscriber
	}

	fn initialize(&self) -> ChannelResult<()> {
		Ok(())
	}

	fn publish(&self, message: &ChannelMessage) -> ChannelResult<()> {
		if self.terminated.load(Ordering::Acquire) {
			return Err(ChannelError::Terminated);
		}
		if self.fail_publish.load(Ordering::Acquire) {
			return Err(ChannelError::Contended);
		}
		self.published.lock().push(message.clone());
		Ok(())
	}

	fn subscribe(&self, _event: EventType, _subscriber: SubscriberId, timeout: Duration) -> SubscribeOutcome {
		if self.terminated.load(Ordering::Acquire) {
			return SubscribeOutcome::Error(ChannelError::Terminated);
		}
		std::thread::sleep(timeout.min(Duration::from_millis(2)));
		SubscribeOutcome::TimedOut
	}

	fn cancel_waiting_subscription(&self, _event: EventType, _subscriber: SubscriberId) -> ChannelResult<()> {
		Ok(())
	}

	fn clean_up_unused_resources(&self) -> ChannelResult<usize> {
		Ok(0)
	}

	fn terminate(&self) {
		self.terminated.store(true, Ordering::Release);
	}
}

/// Hands out a fresh [`RecordingChannel`] per open and remembers them in order.
#[derive(Default)]
pub(crate) struct RecordingFactory {
	opened: Mutex<Vec<Arc<RecordingChannel>>>,
}

impl RecordingFactory {
	pub(crate) fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub(crate) fn opened(&self) -> Vec<Arc<RecordingChannel>> {
		self.opened.lock().clone()
	}
}

impl ChannelFactory for RecordingFactory {
	fn open(&self) -> ChannelResult<Arc<dyn NotificationChannel>> {
		let channel = RecordingChannel::new();
		self.opened.lock().push(Arc::clone(&channel));
		Ok(channel)
	}
}

/// `(sub_type, state, path)` view of one message.
pub(crate) type Note = (EventSubType, BadgeState, String);

pub(crate) fn notes(messages: &[ChannelMessage]) -> Vec<Note> {
	messages
		.iter()
		.map(|m| (m.sub_type, m.badge_state().expect("recorded ordinals are valid"), m.path.clone()))
		.collect()
}

pub(crate) fn add(state: BadgeState, path: &str) -> Note {
	(EventSubType::AddBadgePath, state, path.to_string())
}

pub(crate) fn remove(path: &str) -> Note {
	(EventSubType::RemoveBadgePath, BadgeState::None, path.to_string())
}

/// Polls `check` every few milliseconds until it holds or `timeout` passes.
pub(crate) fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
	let deadline = std::time::Instant::now() + timeout;
	while std::time::Instant::now() < deadline {
		if check() {
			return true;
		}
		std::thread::sleep(Duration::from_millis(5));
	}
	check()
}

/// Routes log output through the test harness. Safe to call repeatedly.
pub(crate) fn init_tracing() {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
