//! Hierarchical badge paths.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Immutable hierarchical path used as a badge key.
///
/// Both `/` and `\` separate segments; empty and `.` segments are dropped and
/// `..` pops the previous segment. Equality, hashing and ordering compare the
/// case-folded segments, so `/Cloud/A.txt` and `\cloud\a.TXT` are the same key.
/// The original casing is kept for display.
#[derive(Clone)]
pub struct BadgePath {
	absolute: bool,
	segments: Vec<String>,
	folded: Vec<String>,
}

impl BadgePath {
	/// Parses and normalizes `raw`.
	pub fn new(raw: &str) -> Self {
		let absolute = raw.starts_with(['/', '\\']);
		let mut segments: Vec<String> = Vec::new();
		for segment in raw.split(['/', '\\']) {
			match segment {
				"" | "." => {}
				".." => {
					segments.pop();
				}
				s => segments.push(s.to_string()),
			}
		}
		Self::from_segments(absolute, segments)
	}

	/// The absolute root `/`.
	pub fn root() -> Self {
		Self::from_segments(true, Vec::new())
	}

	fn from_segments(absolute: bool, segments: Vec<String>) -> Self {
		let folded = segments.iter().map(|s| s.to_lowercase()).collect();
		Self { absolute, segments, folded }
	}

	pub fn is_absolute(&self) -> bool {
		self.absolute
	}

	/// True for a path with no segments (`/` or the empty relative path).
	pub fn is_root(&self) -> bool {
		self.segments.is_empty()
	}

	/// Number of segments.
	pub fn depth(&self) -> usize {
		self.segments.len()
	}

	/// Segments in their original casing.
	pub fn segments(&self) -> impl ExactSizeIterator<Item = &str> + '_ {
		self.segments.iter().map(String::as_str)
	}

	/// Case-folded segments, suitable as tree keys.
	pub fn keys(&self) -> impl ExactSizeIterator<Item = &str> + '_ {
		self.folded.iter().map(String::as_str)
	}

	/// Last segment, if any.
	pub fn file_name(&self) -> Option<&str> {
		self.segments.last().map(String::as_str)
	}

	/// Parent path, or `None` at the root.
	pub fn parent(&self) -> Option<Self> {
		if self.segments.is_empty() {
			return None;
		}
		let mut segments = self.segments.clone();
		segments.pop();
		let mut folded = self.folded.clone();
		folded.pop();
		Some(Self {
			absolute: self.absolute,
			segments,
			folded,
		})
	}

	/// Strict ancestors, nearest first.
	pub fn ancestors(&self) -> impl Iterator<Item = BadgePath> + '_ {
		(0..self.segments.len()).rev().map(|len| self.prefix(len))
	}

	/// Appends one or more segments (separators inside `segment` are honored).
	pub fn join(&self, segment: &str) -> Self {
		let tail = Self::new(segment);
		let mut segments = self.segments.clone();
		segments.extend(tail.segments);
		let mut folded = self.folded.clone();
		folded.extend(tail.folded);
		Self {
			absolute: self.absolute,
			segments,
			folded,
		}
	}

	/// True if `self` equals `base` or lies beneath it.
	pub fn starts_with(&self, base: &BadgePath) -> bool {
		self.absolute == base.absolute && self.folded.len() >= base.folded.len() && self.folded[..base.folded.len()] == base.folded[..]
	}

	/// True if `self` lies strictly beneath `base`.
	pub fn is_descendant_of(&self, base: &BadgePath) -> bool {
		self.depth() > base.depth() && self.starts_with(base)
	}

	/// Moves `self` from under `from` to the same relative position under `to`.
	///
	/// Returns `None` if `self` is not `from` or one of its descendants.
	pub fn rebase(&self, from: &BadgePath, to: &BadgePath) -> Option<Self> {
		if !self.starts_with(from) {
			return None;
		}
		let mut segments = to.segments.clone();
		segments.extend_from_slice(&self.segments[from.depth()..]);
		let mut folded = to.folded.clone();
		folded.extend_from_slice(&self.folded[from.depth()..]);
		Some(Self {
			absolute: to.absolute,
			segments,
			folded,
		})
	}

	fn prefix(&self, len: usize) -> Self {
		Self {
			absolute: self.absolute,
			segments: self.segments[..len].to_vec(),
			folded: self.folded[..len].to_vec(),
		}
	}
}

impl PartialEq for BadgePath {
	fn eq(&self, other: &Self) -> bool {
		self.absolute == other.absolute && self.folded == other.folded
	}
}

impl Eq for BadgePath {}

impl Hash for BadgePath {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.absolute.hash(state);
		self.folded.hash(state);
	}
}

impl Ord for BadgePath {
	fn cmp(&self, other: &Self) -> Ordering {
		self.absolute.cmp(&other.absolute).then_with(|| self.folded.cmp(&other.folded))
	}
}

impl PartialOrd for BadgePath {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl fmt::Display for BadgePath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.absolute {
			f.write_str("/")?;
		}
		for (i, segment) in self.segments.iter().enumerate() {
			if i > 0 {
				f.write_str("/")?;
			}
			f.write_str(segment)?;
		}
		Ok(())
	}
}

impl fmt::Debug for BadgePath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "BadgePath({self})")
	}
}

impl From<&str> for BadgePath {
	fn from(raw: &str) -> Self {
		Self::new(raw)
	}
}

impl From<String> for BadgePath {
	fn from(raw: String) -> Self {
		Self::new(&raw)
	}
}

impl FromStr for BadgePath {
	type Err = std::convert::Infallible;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self::new(s))
	}
}
