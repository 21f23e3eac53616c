/// Execution classes used for worker scheduling and observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
	/// Dedicated threads parked in bounded transport waits.
	Listener,
	/// Periodic supervision loops (watchdogs).
	Supervision,
	/// Short-lived drains of queued state mutations.
	Drain,
	/// Async event pumps living on the shared runtime.
	Pump,
}

impl TaskClass {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Listener => "listener",
			Self::Supervision => "supervision",
			Self::Drain => "drain",
			Self::Pump => "pump",
		}
	}
}
