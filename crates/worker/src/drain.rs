//! FIFO queue applied by at most one on-demand drain task.
//!
//! Nothing is parked while the queue is idle. The first enqueue into an idle
//! queue spawns a drain task on the blocking pool; that task keeps popping
//! until it observes an empty queue under the lock, then clears the draining
//! flag and exits. Items enqueued while a drain is active are picked up by the
//! active drain, so handler invocations never overlap and keep submission order.
//!
//! A drain task dropped before it runs (the runtime is shutting down) clears
//! the draining flag and keeps the pending items, so the next enqueue spawns
//! a fresh drain.

use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::TaskClass;

type DrainHandler<T> = dyn Fn(T) + Send + Sync;

/// Outcome from enqueueing one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
	/// The queue was idle; a new drain task was spawned.
	Spawned,
	/// A drain task is active and will pick the item up.
	Appended,
}

/// Returned when enqueueing into a closed queue. Carries the rejected item.
pub struct DrainClosed<T>(pub T);

impl<T> fmt::Debug for DrainClosed<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("DrainClosed(..)")
	}
}

impl<T> fmt::Display for DrainClosed<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("drain queue closed")
	}
}

impl<T> std::error::Error for DrainClosed<T> {}

struct DrainState<T> {
	queue: VecDeque<T>,
	draining: bool,
	closed: bool,
	drains_spawned: u64,
}

struct DrainInner<T> {
	name: String,
	class: TaskClass,
	handler: Box<DrainHandler<T>>,
	state: Mutex<DrainState<T>>,
	idle: Condvar,
}

/// Cloneable handle to one drain queue.
pub struct DrainQueue<T> {
	inner: Arc<DrainInner<T>>,
}

impl<T> Clone for DrainQueue<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> DrainQueue<T>
where
	T: Send + 'static,
{
	/// Creates an idle queue whose items are applied by `handler`.
	pub fn new(name: impl Into<String>, class: TaskClass, handler: impl Fn(T) + Send + Sync + 'static) -> Self {
		Self {
			inner: Arc::new(DrainInner {
				name: name.into(),
				class,
				handler: Box::new(handler),
				state: Mutex::new(DrainState {
					queue: VecDeque::new(),
					draining: false,
					closed: false,
					drains_spawned: 0,
				}),
				idle: Condvar::new(),
			}),
		}
	}

	/// Appends one item, spawning a drain task if none is active.
	pub fn enqueue(&self, item: T) -> Result<DrainOutcome, DrainClosed<T>> {
		let mut state = self.inner.state.lock();
		if state.closed {
			return Err(DrainClosed(item));
		}
		state.queue.push_back(item);
		if state.draining {
			return Ok(DrainOutcome::Appended);
		}
		state.draining = true;
		state.drains_spawned = state.drains_spawned.wrapping_add(1);
		let pending = state.queue.len();
		drop(state);

		tracing::trace!(queue = %self.inner.name, pending, "worker.drain.spawn");
		let mut guard = DrainGuard {
			inner: Arc::clone(&self.inner),
			armed: true,
		};
		// The handle is not needed: completion is observed through `idle`.
		let _ = crate::spawn_blocking(self.inner.class, move || {
			drain(&guard.inner);
			guard.armed = false;
		});
		Ok(DrainOutcome::Spawned)
	}

	/// Number of items waiting to be applied.
	pub fn len(&self) -> usize {
		self.inner.state.lock().queue.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	#[cfg(test)]
	pub(crate) fn is_draining(&self) -> bool {
		self.inner.state.lock().draining
	}

	/// Total drain tasks spawned over the queue's lifetime.
	pub fn drains_spawned(&self) -> u64 {
		self.inner.state.lock().drains_spawned
	}

	/// Blocks until the queue is empty and no drain is active.
	///
	/// Returns `false` if `timeout` elapsed first.
	pub fn wait_idle(&self, timeout: Duration) -> bool {
		let mut state = self.inner.state.lock();
		let result = self
			.inner
			.idle
			.wait_while_for(&mut state, |st| st.draining || !st.queue.is_empty(), timeout);
		!result.timed_out()
	}

	/// Rejects further items. Already queued items are still applied.
	pub fn close(&self) {
		self.inner.state.lock().closed = true;
	}

	pub fn is_closed(&self) -> bool {
		self.inner.state.lock().closed
	}
}

/// Owned by a spawned drain task. Still armed on drop means the task never
/// got to run its drain loop.
struct DrainGuard<T> {
	inner: Arc<DrainInner<T>>,
	armed: bool,
}

impl<T> Drop for DrainGuard<T> {
	fn drop(&mut self) {
		if !self.armed {
			return;
		}
		let mut state = self.inner.state.lock();
		state.draining = false;
		let pending = state.queue.len();
		drop(state);
		self.inner.idle.notify_all();
		tracing::warn!(queue = %self.inner.name, pending, "worker.drain.abandoned");
	}
}

fn drain<T>(inner: &DrainInner<T>) {
	let mut applied = 0usize;
	loop {
		let item = {
			let mut state = inner.state.lock();
			match state.queue.pop_front() {
				Some(item) => item,
				None => {
					state.draining = false;
					drop(state);
					inner.idle.notify_all();
					tracing::trace!(queue = %inner.name, applied, "worker.drain.idle");
					return;
				}
			}
		};

		// A panicking handler must not leave `draining` stuck at true.
		if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| (inner.handler)(item))) {
			let message = crate::panic_message(payload.as_ref());
			tracing::error!(queue = %inner.name, %message, "worker.drain.handler_panicked");
		}
		applied = applied.wrapping_add(1);
	}
}
