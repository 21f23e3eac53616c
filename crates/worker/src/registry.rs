use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::TaskClass;

/// Snapshot for one supervised worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
	pub name: String,
	pub class: TaskClass,
	pub generation: u64,
	pub restarts: usize,
	pub last_exit: Option<String>,
}

impl WorkerRecord {
	pub fn new(name: impl Into<String>, class: TaskClass) -> Self {
		Self {
			name: name.into(),
			class,
			generation: 0,
			restarts: 0,
			last_exit: None,
		}
	}
}

/// In-memory worker registry for status snapshots.
#[derive(Debug, Default, Clone)]
pub struct WorkerRegistry {
	inner: Arc<RwLock<HashMap<String, WorkerRecord>>>,
}

impl WorkerRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Upserts one record.
	pub fn upsert(&self, record: WorkerRecord) {
		self.inner.write().insert(record.name.clone(), record);
	}

	/// Applies `f` to the named record, creating it first if needed.
	pub fn update(&self, name: &str, class: TaskClass, f: impl FnOnce(&mut WorkerRecord)) {
		let mut guard = self.inner.write();
		let record = guard.entry(name.to_string()).or_insert_with(|| WorkerRecord::new(name, class));
		f(record);
	}

	pub fn get(&self, name: &str) -> Option<WorkerRecord> {
		self.inner.read().get(name).cloned()
	}

	/// Returns snapshots sorted by name.
	pub fn snapshots(&self) -> Vec<WorkerRecord> {
		let mut records: Vec<_> = self.inner.read().values().cloned().collect();
		records.sort_by(|a, b| a.name.cmp(&b.name));
		records
	}
}
