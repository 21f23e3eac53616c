//! Basic badge primitives.
//!
//! [`BadgePath`] is the hierarchical, case-insensitive key every badge is
//! stored under; [`BadgeState`] is the closed set of overlay states whose
//! ordinals cross the process boundary; [`PathState`] is the sync layer's
//! view of a path, mapped onto badges.

pub mod path;
pub mod state;

pub use path::BadgePath;
pub use state::{BadgeState, PathState, UnknownBadgeState};
