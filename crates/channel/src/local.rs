//! In-process channel hub.
//!
//! [`LocalChannelHub`] owns named, uuid-scoped endpoints. Every
//! [`LocalChannel`] opened on the same `(name, scope)` pair shares one
//! endpoint, and each subscription `(event, subscriber)` gets its own bounded
//! frame queue. Publishing copies the frame into every matching queue and
//! wakes waiters; a full queue drops its oldest frame.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::{ChannelError, ChannelFactory, ChannelMessage, EventType, NotificationChannel, Result, SubscribeOutcome, SubscriberId, frame};

/// Tuning for a [`LocalChannelHub`].
#[derive(Debug, Clone)]
pub struct LocalChannelConfig {
	/// Frames buffered per subscription before the oldest is dropped.
	pub queue_capacity: usize,
	/// Idle time after which a subscription that is not waiting is reclaimed.
	pub stale_after: Duration,
	/// Longest wait for a contended endpoint lock.
	pub contention_wait: Duration,
	/// Live endpoints the hub will allocate.
	pub max_endpoints: usize,
}

impl Default for LocalChannelConfig {
	fn default() -> Self {
		Self {
			queue_capacity: 1024,
			stale_after: Duration::from_secs(60),
			contention_wait: Duration::from_millis(50),
			max_endpoints: 64,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointKey {
	name: String,
	scope: Uuid,
}

struct Slot {
	frames: VecDeque<Vec<u8>>,
	waiting: bool,
	cancel_requested: bool,
	last_seen: Instant,
	dropped: u64,
}

impl Slot {
	fn new() -> Self {
		Self {
			frames: VecDeque::new(),
			waiting: false,
			cancel_requested: false,
			last_seen: Instant::now(),
			dropped: 0,
		}
	}
}

#[derive(Default)]
struct EndpointState {
	slots: HashMap<(EventType, SubscriberId), Slot>,
}

struct Endpoint {
	key: EndpointKey,
	state: Mutex<EndpointState>,
	wake: Condvar,
}

/// Registry of live endpoints.
pub struct LocalChannelHub {
	config: LocalChannelConfig,
	endpoints: Mutex<HashMap<EndpointKey, Weak<Endpoint>>>,
}

impl LocalChannelHub {
	/// Creates a hub with default tuning.
	pub fn new() -> Arc<Self> {
		Self::with_config(LocalChannelConfig::default())
	}

	/// Creates a hub with explicit tuning.
	pub fn with_config(config: LocalChannelConfig) -> Arc<Self> {
		Arc::new(Self {
			config,
			endpoints: Mutex::new(HashMap::new()),
		})
	}

	/// Hub tuning.
	pub fn config(&self) -> &LocalChannelConfig {
		&self.config
	}

	/// Creates an uninitialized channel on `(name, scope)` with a fresh subscriber identity.
	pub fn channel(self: &Arc<Self>, name: impl Into<String>, scope: Uuid) -> LocalChannel {
		LocalChannel {
			hub: Arc::clone(self),
			key: EndpointKey { name: name.into(), scope },
			subscriber: SubscriberId::new(),
			endpoint: Mutex::new(None),
			terminated: AtomicBool::new(false),
		}
	}

	/// Number of endpoints still referenced by at least one channel.
	pub fn live_endpoints(&self) -> usize {
		self.endpoints.lock().values().filter(|e| e.strong_count() > 0).count()
	}

	fn acquire(&self, key: &EndpointKey) -> Result<Arc<Endpoint>> {
		let mut endpoints = self.endpoints.lock();
		endpoints.retain(|_, endpoint| endpoint.strong_count() > 0);
		if let Some(endpoint) = endpoints.get(key).and_then(Weak::upgrade) {
			return Ok(endpoint);
		}
		if endpoints.len() >= self.config.max_endpoints {
			return Err(ChannelError::ResourceExhausted {
				limit: self.config.max_endpoints,
			});
		}
		let endpoint = Arc::new(Endpoint {
			key: key.clone(),
			state: Mutex::new(EndpointState::default()),
			wake: Condvar::new(),
		});
		endpoints.insert(key.clone(), Arc::downgrade(&endpoint));
		tracing::debug!(name = %key.name, scope = %key.scope, "channel.endpoint.allocated");
		Ok(endpoint)
	}
}

/// One handle onto a hub endpoint.
pub struct LocalChannel {
	hub: Arc<LocalChannelHub>,
	key: EndpointKey,
	subscriber: SubscriberId,
	endpoint: Mutex<Option<Arc<Endpoint>>>,
	terminated: AtomicBool,
}

impl LocalChannel {
	fn endpoint(&self) -> Result<Arc<Endpoint>> {
		if self.terminated.load(Ordering::Acquire) {
			return Err(ChannelError::Terminated);
		}
		self.endpoint.lock().clone().ok_or(ChannelError::NotInitialized)
	}

	fn contention_wait(&self) -> Duration {
		self.hub.config.contention_wait
	}
}

impl NotificationChannel for LocalChannel {
	fn subscriber_id(&self) -> SubscriberId {
		self.subscriber
	}

	fn initialize(&self) -> Result<()> {
		if self.terminated.load(Ordering::Acquire) {
			return Err(ChannelError::Terminated);
		}
		let mut endpoint = self.endpoint.lock();
		if endpoint.is_none() {
			*endpoint = Some(self.hub.acquire(&self.key)?);
		}
		Ok(())
	}

	fn publish(&self, message: &ChannelMessage) -> Result<()> {
		let frame = frame::encode(message)?;
		let endpoint = self.endpoint()?;
		let capacity = self.hub.config.queue_capacity;
		let delivered = {
			let mut state = endpoint.state.try_lock_for(self.contention_wait()).ok_or(ChannelError::Contended)?;
			let mut delivered = 0usize;
			for ((event, subscriber), slot) in state.slots.iter_mut() {
				if *event != message.event {
					continue;
				}
				if slot.frames.len() >= capacity {
					slot.frames.pop_front();
					slot.dropped = slot.dropped.wrapping_add(1);
					tracing::warn!(subscriber = %subscriber, dropped = slot.dropped, "channel.queue.overflow");
				}
				slot.frames.push_back(frame.clone());
				delivered += 1;
			}
			delivered
		};
		endpoint.wake.notify_all();
		tracing::trace!(
			name = %endpoint.key.name,
			event = ?message.event,
			sub_type = ?message.sub_type,
			path = %message.path,
			delivered,
			"channel.publish"
		);
		Ok(())
	}

	fn subscribe(&self, event: EventType, subscriber: SubscriberId, timeout: Duration) -> SubscribeOutcome {
		let endpoint = match self.endpoint() {
			Ok(endpoint) => endpoint,
			Err(err) => return SubscribeOutcome::Error(err),
		};
		let Some(mut state) = endpoint.state.try_lock_for(self.contention_wait()) else {
			return SubscribeOutcome::TryAgain;
		};

		// An unrepresentable deadline waits until an event or a cancel.
		let deadline = Instant::now().checked_add(timeout);
		let key = (event, subscriber);
		loop {
			let outcome = {
				let slot = state.slots.entry(key).or_insert_with(Slot::new);
				slot.last_seen = Instant::now();
				if self.terminated.load(Ordering::Acquire) {
					Some(SubscribeOutcome::Error(ChannelError::Terminated))
				} else if slot.cancel_requested {
					slot.cancel_requested = false;
					Some(SubscribeOutcome::Cancelled)
				} else if let Some(frame) = slot.frames.pop_front() {
					Some(match frame::decode(&frame) {
						Ok(message) => SubscribeOutcome::GotEvent(message),
						Err(err) => SubscribeOutcome::Error(err),
					})
				} else if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
					Some(SubscribeOutcome::TimedOut)
				} else {
					slot.waiting = true;
					None
				}
			};
			if let Some(outcome) = outcome {
				if let Some(slot) = state.slots.get_mut(&key) {
					slot.waiting = false;
				}
				return outcome;
			}
			match deadline {
				Some(deadline) => {
					endpoint.wake.wait_until(&mut state, deadline);
				}
				None => endpoint.wake.wait(&mut state),
			}
		}
	}

	fn cancel_waiting_subscription(&self, event: EventType, subscriber: SubscriberId) -> Result<()> {
		let endpoint = self.endpoint()?;
		let cancelled = {
			let mut state = endpoint.state.lock();
			match state.slots.get_mut(&(event, subscriber)) {
				Some(slot) if slot.waiting => {
					slot.cancel_requested = true;
					true
				}
				_ => false,
			}
		};
		if cancelled {
			endpoint.wake.notify_all();
		}
		tracing::debug!(subscriber = %subscriber, event = ?event, cancelled, "channel.subscription.cancel");
		Ok(())
	}

	fn clean_up_unused_resources(&self) -> Result<usize> {
		let endpoint = self.endpoint()?;
		let stale_after = self.hub.config.stale_after;
		let mut state = endpoint.state.try_lock_for(self.contention_wait()).ok_or(ChannelError::Contended)?;
		let before = state.slots.len();
		state.slots.retain(|_, slot| slot.waiting || slot.last_seen.elapsed() < stale_after);
		let reclaimed = before - state.slots.len();
		if reclaimed > 0 {
			tracing::debug!(name = %endpoint.key.name, reclaimed, "channel.cleanup");
		}
		Ok(reclaimed)
	}

	fn terminate(&self) {
		if self.terminated.swap(true, Ordering::AcqRel) {
			return;
		}
		let Some(endpoint) = self.endpoint.lock().take() else {
			return;
		};
		endpoint.state.lock().slots.retain(|(_, subscriber), _| *subscriber != self.subscriber);
		endpoint.wake.notify_all();
		tracing::debug!(name = %endpoint.key.name, subscriber = %self.subscriber, "channel.terminated");
	}
}

impl Drop for LocalChannel {
	fn drop(&mut self) {
		self.terminate();
	}
}

/// [`ChannelFactory`] opening channels on one hub endpoint.
#[derive(Clone)]
pub struct LocalChannelFactory {
	hub: Arc<LocalChannelHub>,
	name: String,
	scope: Uuid,
}

impl LocalChannelFactory {
	/// Factory for `(name, scope)` on `hub`.
	pub fn new(hub: Arc<LocalChannelHub>, name: impl Into<String>, scope: Uuid) -> Self {
		Self {
			hub,
			name: name.into(),
			scope,
		}
	}

	/// Opens an initialized [`LocalChannel`] without erasing its type.
	pub fn open_local(&self) -> Result<LocalChannel> {
		let channel = self.hub.channel(self.name.clone(), self.scope);
		channel.initialize()?;
		Ok(channel)
	}
}

impl ChannelFactory for LocalChannelFactory {
	fn open(&self) -> Result<Arc<dyn NotificationChannel>> {
		Ok(Arc::new(self.open_local()?))
	}
}
