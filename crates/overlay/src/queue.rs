//! FIFO queue of badge mutations.
//!
//! Producers on any thread enqueue [`BadgeRequest`]s; a [`DrainQueue`] applies
//! them to the engine one at a time, in submission order, spawning a drain
//! task only while there is work. Requests the engine rejects are logged and
//! dropped so one bad request never stalls the ones behind it.

use std::fmt;
use std::time::Duration;

use sigil_primitives::{BadgePath, BadgeState, PathState};
use sigil_worker::{DrainClosed, DrainOutcome, DrainQueue, TaskClass};

use crate::engine::BadgeStateEngine;
use crate::error::Result;

const QUEUE_NAME: &str = "overlay.badge_requests";

/// What happened to a file, as reported by the sync layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
	Created,
	Modified,
	Deleted,
	Renamed,
}

/// Which side originated a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeDirection {
	/// Local change being uploaded.
	ToRemote,
	/// Remote change being applied locally.
	FromRemote,
}

/// One merged file change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
	pub kind: ChangeKind,
	pub direction: ChangeDirection,
	pub path: BadgePath,
	/// Source path of a rename.
	pub previous: Option<BadgePath>,
}

impl FileChange {
	pub fn new(kind: ChangeKind, direction: ChangeDirection, path: BadgePath) -> Self {
		Self {
			kind,
			direction,
			path,
			previous: None,
		}
	}

	pub fn renamed(direction: ChangeDirection, from: BadgePath, to: BadgePath) -> Self {
		Self {
			kind: ChangeKind::Renamed,
			direction,
			path: to,
			previous: Some(from),
		}
	}
}

/// A single queued engine mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BadgeRequest {
	Set { path: BadgePath, state: BadgeState },
	/// Sync-layer state, mapped onto a badge before it is stored.
	PathState { path: BadgePath, state: PathState },
	Delete { path: BadgePath, pending: bool },
	Rename { from: BadgePath, to: BadgePath },
	FileChange(FileChange),
}

impl BadgeRequest {
	/// Applies this request to `engine`.
	///
	/// A renamed upload still marks its destination `Syncing` when the rename
	/// itself fails; the rename error is returned afterwards. A rename without
	/// a source path is handled like a creation.
	pub fn apply(&self, engine: &BadgeStateEngine) -> Result<()> {
		match self {
			Self::Set { path, state } => engine.set_badge(path, *state),
			Self::PathState { path, state } => engine.set_badge(path, BadgeState::from(*state)),
			Self::Delete { path, pending } => engine.delete_badge_path(path, *pending).map(drop),
			Self::Rename { from, to } => engine.rename_badge_path(from, to),
			Self::FileChange(change) => apply_file_change(engine, change),
		}
	}
}

fn apply_file_change(engine: &BadgeStateEngine, change: &FileChange) -> Result<()> {
	let upload = change.direction == ChangeDirection::ToRemote;
	match (change.kind, &change.previous) {
		(ChangeKind::Created | ChangeKind::Modified, _) | (ChangeKind::Renamed, None) => engine.set_badge(&change.path, BadgeState::Syncing),
		(ChangeKind::Deleted, _) => engine.delete_badge_path(&change.path, upload).map(drop),
		(ChangeKind::Renamed, Some(previous)) => {
			let renamed = engine.rename_badge_path(previous, &change.path);
			if upload {
				engine.set_badge(&change.path, BadgeState::Syncing)?;
			}
			renamed
		}
	}
}

impl fmt::Display for BadgeRequest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Set { path, state } => write!(f, "set {path} {state}"),
			Self::PathState { path, state } => write!(f, "set {path} {state:?}"),
			Self::Delete { path, pending: true } => write!(f, "delete {path} pending"),
			Self::Delete { path, pending: false } => write!(f, "delete {path}"),
			Self::Rename { from, to } => write!(f, "rename {from} {to}"),
			Self::FileChange(change) => match &change.previous {
				Some(previous) => write!(f, "{:?} {:?} {previous} -> {}", change.kind, change.direction, change.path),
				None => write!(f, "{:?} {:?} {}", change.kind, change.direction, change.path),
			},
		}
	}
}

/// Cloneable handle feeding one engine.
#[derive(Clone)]
pub struct BadgeRequestQueue {
	queue: DrainQueue<BadgeRequest>,
}

impl BadgeRequestQueue {
	pub fn new(engine: BadgeStateEngine) -> Self {
		let queue = DrainQueue::new(QUEUE_NAME, TaskClass::Drain, move |request: BadgeRequest| match request.apply(&engine) {
			Ok(()) => tracing::trace!(%request, "overlay.queue.applied"),
			Err(err) => tracing::warn!(%request, error = %err, "overlay.queue.request_dropped"),
		});
		Self { queue }
	}

	/// Appends `request`; fails only once the queue is closed.
	pub fn enqueue(&self, request: BadgeRequest) -> std::result::Result<DrainOutcome, DrainClosed<BadgeRequest>> {
		self.queue.enqueue(request)
	}

	pub fn set_badge(&self, path: BadgePath, state: BadgeState) -> std::result::Result<DrainOutcome, DrainClosed<BadgeRequest>> {
		self.enqueue(BadgeRequest::Set { path, state })
	}

	pub fn set_path_state(&self, path: BadgePath, state: PathState) -> std::result::Result<DrainOutcome, DrainClosed<BadgeRequest>> {
		self.enqueue(BadgeRequest::PathState { path, state })
	}

	pub fn delete_badge_path(&self, path: BadgePath, pending: bool) -> std::result::Result<DrainOutcome, DrainClosed<BadgeRequest>> {
		self.enqueue(BadgeRequest::Delete { path, pending })
	}

	pub fn rename_badge_path(&self, from: BadgePath, to: BadgePath) -> std::result::Result<DrainOutcome, DrainClosed<BadgeRequest>> {
		self.enqueue(BadgeRequest::Rename { from, to })
	}

	pub fn file_change(&self, change: FileChange) -> std::result::Result<DrainOutcome, DrainClosed<BadgeRequest>> {
		self.enqueue(BadgeRequest::FileChange(change))
	}

	/// Requests not yet picked up by the drain task.
	pub fn len(&self) -> usize {
		self.queue.len()
	}

	pub fn is_empty(&self) -> bool {
		self.queue.is_empty()
	}

	/// Blocks until every queued request is applied. `false` on timeout.
	pub fn wait_idle(&self, timeout: Duration) -> bool {
		self.queue.wait_idle(timeout)
	}

	/// Rejects new requests; queued ones still drain.
	pub fn close(&self) {
		self.queue.close();
	}

	pub fn is_closed(&self) -> bool {
		self.queue.is_closed()
	}
}
