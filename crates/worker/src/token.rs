use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

/// Monotonic generation clock for restartable workers.
///
/// Clones share the same counter, so generations stay unique across every
/// holder of the clock.
#[derive(Debug, Default, Clone)]
pub struct GenerationClock {
	next: Arc<AtomicU64>,
}

impl GenerationClock {
	/// Creates a new clock whose first generation is 1.
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the next generation ID.
	pub fn next(&self) -> u64 {
		self.next.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
	}

	/// Returns the most recently issued generation, or 0 if none was issued.
	pub fn current(&self) -> u64 {
		self.next.load(Ordering::Acquire)
	}
}

/// Generation-scoped cancellation token for one worker incarnation.
///
/// A restarted worker gets a fresh token; cancelling it retires that
/// generation without touching its successor.
#[derive(Debug, Clone)]
pub struct GenerationToken {
	generation: u64,
	cancel: CancellationToken,
}

impl GenerationToken {
	pub fn new(generation: u64, cancel: CancellationToken) -> Self {
		Self { generation, cancel }
	}

	/// Creates a token under `parent`, so cancelling the parent retires it too.
	pub fn child_of(generation: u64, parent: &CancellationToken) -> Self {
		Self::new(generation, parent.child_token())
	}

	pub const fn generation(&self) -> u64 {
		self.generation
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}

	pub fn cancel(&self) {
		self.cancel.cancel();
	}
}
