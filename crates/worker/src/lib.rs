//! Shared worker primitives for the overlay engine.
//!
//! * [`TaskClass`]: scheduling/observability class attached to every spawn
//! * [`spawn`], [`spawn_blocking`], [`spawn_named_thread`]: runtime entry points
//! * [`GenerationClock`] / [`GenerationToken`]: restartable worker lifecycles
//! * [`WorkerRegistry`]: status snapshots for supervised workers
//! * [`DrainQueue`]: FIFO queue drained by at most one on-demand task
//! * [`panic_message`]: readable text from caught panic payloads

mod class;
mod drain;
mod panic;
mod registry;
mod spawn;
mod token;

pub use class::TaskClass;
pub use drain::{DrainClosed, DrainOutcome, DrainQueue};
pub use panic::panic_message;
pub use registry::{WorkerRecord, WorkerRegistry};
pub use spawn::{spawn, spawn_blocking, spawn_named_thread};
pub use token::{GenerationClock, GenerationToken};
