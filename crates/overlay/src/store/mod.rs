//! Prefix tree of badge values keyed by [`BadgePath`].
//!
//! Every inserted path gets a node, and so does each of its ancestors; only
//! inserted paths carry a value. A node without a value defers to its
//! subtree when the engine computes effective badges.
//!
//! The store is not synchronized. Callers (the engine) serialize access
//! behind their own lock. Delete and rename report every touched node through
//! a caller-supplied callback while the structural operation is in progress;
//! the callback cannot reach back into the store because the store is
//! mutably borrowed for the whole call.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use sigil_primitives::{BadgePath, BadgeState};
use thiserror::Error;

/// Why a native rename did not happen. No mutation occurred in any case.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenameError {
	#[error("rename source {0} does not exist")]
	SourceMissing(BadgePath),
	#[error("cannot move {from} into its own subtree at {to}")]
	IntoOwnSubtree { from: BadgePath, to: BadgePath },
	#[error("the store root cannot be moved")]
	RootNotMovable,
	#[cfg(test)]
	#[error("injected rename failure")]
	Injected,
}

/// One node of the tree.
#[derive(Debug, Clone)]
pub struct BadgeNode {
	path: BadgePath,
	value: Option<BadgeState>,
	children: BTreeMap<String, BadgeNode>,
}

impl BadgeNode {
	fn new(path: BadgePath) -> Self {
		Self {
			path,
			value: None,
			children: BTreeMap::new(),
		}
	}

	pub fn path(&self) -> &BadgePath {
		&self.path
	}

	/// Explicit value, if one was stored.
	pub fn value(&self) -> Option<BadgeState> {
		self.value
	}

	/// Children in key order (case-folded segment).
	pub fn children(&self) -> impl Iterator<Item = &BadgeNode> + '_ {
		self.children.values()
	}

	fn child(&self, key: &str) -> Option<&BadgeNode> {
		self.children.get(key)
	}

	fn child_mut(&mut self, key: &str) -> Option<&mut BadgeNode> {
		self.children.get_mut(key)
	}

	/// Visits every strict descendant, children before parents.
	fn visit_descendants_postorder(&self, f: &mut impl FnMut(&BadgeNode)) {
		for child in self.children.values() {
			child.visit_descendants_postorder(f);
			f(child);
		}
	}

	fn count(&self) -> usize {
		1 + self.children.values().map(BadgeNode::count).sum::<usize>()
	}
}

/// Immutable copy of one subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeSnapshot {
	pub path: BadgePath,
	pub value: Option<BadgeState>,
	pub children: Vec<TreeSnapshot>,
}

impl TreeSnapshot {
	fn capture(node: &BadgeNode) -> Self {
		Self {
			path: node.path.clone(),
			value: node.value,
			children: node.children.values().map(Self::capture).collect(),
		}
	}

	/// Every node of the snapshot, children before parents; the root comes last.
	pub fn entries_postorder(&self) -> Vec<(BadgePath, Option<BadgeState>)> {
		let mut out = Vec::new();
		self.collect_postorder(&mut out);
		out
	}

	/// Strict descendants of the root, children before parents.
	pub fn descendants_postorder(&self) -> Vec<(BadgePath, Option<BadgeState>)> {
		let mut out = self.entries_postorder();
		out.pop();
		out
	}

	fn collect_postorder(&self, out: &mut Vec<(BadgePath, Option<BadgeState>)>) {
		for child in &self.children {
			child.collect_postorder(out);
		}
		out.push((self.path.clone(), self.value));
	}
}

/// A node leaving the tree during [`BadgeStore::remove`].
#[derive(Debug, Clone, Copy)]
pub struct RemovedNode<'a> {
	pub path: &'a BadgePath,
	pub value: Option<BadgeState>,
	/// The path `remove` was called with.
	pub removed_root: &'a BadgePath,
}

/// A node being re-keyed during [`BadgeStore::rename`].
#[derive(Debug, Clone, Copy)]
pub struct RenamedNode<'a> {
	pub old_path: &'a BadgePath,
	pub new_path: &'a BadgePath,
	pub value: Option<BadgeState>,
	pub old_root: &'a BadgePath,
	pub new_root: &'a BadgePath,
}

/// The badge tree.
#[derive(Debug, Clone)]
pub struct BadgeStore {
	root: BadgeNode,
	#[cfg(test)]
	fail_next_rename: bool,
}

impl Default for BadgeStore {
	fn default() -> Self {
		Self::new()
	}
}

impl BadgeStore {
	pub fn new() -> Self {
		Self {
			root: BadgeNode::new(BadgePath::root()),
			#[cfg(test)]
			fail_next_rename: false,
		}
	}

	/// Total node count, including the root.
	pub fn node_count(&self) -> usize {
		self.root.count()
	}

	pub fn node(&self, path: &BadgePath) -> Option<&BadgeNode> {
		path.keys().try_fold(&self.root, |node, key| node.child(key))
	}

	fn node_mut(&mut self, path: &BadgePath) -> Option<&mut BadgeNode> {
		path.keys().try_fold(&mut self.root, |node, key| node.child_mut(key))
	}

	/// Existing nodes from the root down towards `path`, ending at the deepest one present.
	pub fn lineage(&self, path: &BadgePath) -> Vec<&BadgeNode> {
		let mut out = vec![&self.root];
		let mut node = &self.root;
		for key in path.keys() {
			match node.child(key) {
				Some(child) => {
					out.push(child);
					node = child;
				}
				None => break,
			}
		}
		out
	}

	fn ensure_node(&mut self, path: &BadgePath) -> &mut BadgeNode {
		let mut node = &mut self.root;
		for (segment, key) in path.segments().zip(path.keys()) {
			let child_path = node.path.join(segment);
			node = node.children.entry(key.to_string()).or_insert_with(|| BadgeNode::new(child_path));
		}
		node
	}

	pub fn contains(&self, path: &BadgePath) -> bool {
		self.node(path).is_some()
	}

	/// Explicit value at `path`. Does not consult children.
	pub fn try_get(&self, path: &BadgePath) -> Option<BadgeState> {
		self.node(path).and_then(BadgeNode::value)
	}

	/// Inserts or overwrites the value at `path`, creating missing ancestor
	/// nodes without values.
	pub fn set(&mut self, path: &BadgePath, value: Option<BadgeState>) {
		self.ensure_node(path).value = value;
	}

	/// Copies the subtree rooted at `path`.
	pub fn extract_subtree(&self, path: &BadgePath) -> Option<TreeSnapshot> {
		self.node(path).map(TreeSnapshot::capture)
	}

	/// Every node carrying a value, in key order.
	pub fn entries(&self) -> Vec<(BadgePath, BadgeState)> {
		let mut out = Vec::new();
		if let Some(value) = self.root.value {
			out.push((self.root.path.clone(), value));
		}
		fn walk(node: &BadgeNode, out: &mut Vec<(BadgePath, BadgeState)>) {
			for child in node.children.values() {
				if let Some(value) = child.value {
					out.push((child.path.clone(), value));
				}
				walk(child, out);
			}
		}
		walk(&self.root, &mut out);
		out
	}

	/// Removes `path` and its subtree.
	///
	/// `on_removed` runs for every strict descendant, children first, while the
	/// subtree is still attached. The removed root itself is not reported.
	/// Removing the root path clears the tree.
	pub fn remove(&mut self, path: &BadgePath, mut on_removed: impl FnMut(RemovedNode<'_>)) -> bool {
		let Some(node) = self.node(path) else {
			return false;
		};
		node.visit_descendants_postorder(&mut |descendant| {
			on_removed(RemovedNode {
				path: &descendant.path,
				value: descendant.value,
				removed_root: path,
			})
		});

		let Some(parent_path) = path.parent() else {
			self.root.children.clear();
			self.root.value = None;
			return true;
		};
		let removed = match (self.node_mut(&parent_path), path.keys().last()) {
			(Some(parent), Some(key)) => parent.children.remove(key).is_some(),
			_ => false,
		};
		debug_assert!(removed, "node found by lookup must be detachable");
		removed
	}

	/// Moves the subtree at `from` to `to`.
	///
	/// `on_renamed` runs for every moved node (the moved root included),
	/// children first. An existing subtree at `to` is merged with the moved
	/// one, moved values taking precedence. On error nothing was changed.
	pub fn rename(&mut self, from: &BadgePath, to: &BadgePath, mut on_renamed: impl FnMut(RenamedNode<'_>)) -> Result<(), RenameError> {
		#[cfg(test)]
		{
			if std::mem::take(&mut self.fail_next_rename) {
				return Err(RenameError::Injected);
			}
		}
		let Some(parent_path) = from.parent() else {
			return Err(RenameError::RootNotMovable);
		};
		if !self.contains(from) {
			return Err(RenameError::SourceMissing(from.clone()));
		}
		if from == to {
			return Ok(());
		}
		if to.starts_with(from) {
			return Err(RenameError::IntoOwnSubtree {
				from: from.clone(),
				to: to.clone(),
			});
		}

		let detached = match (self.node_mut(&parent_path), from.keys().last()) {
			(Some(parent), Some(key)) => parent.children.remove(key),
			_ => None,
		};
		let Some(mut moved) = detached else {
			return Err(RenameError::SourceMissing(from.clone()));
		};
		rekey(&mut moved, from, to, &mut on_renamed);

		match to.keys().last() {
			None => merge(&mut self.root, moved),
			Some(key) => {
				let key = key.to_string();
				let parent = match to.parent() {
					Some(parent) => self.ensure_node(&parent),
					None => &mut self.root,
				};
				match parent.children.entry(key) {
					Entry::Vacant(slot) => {
						slot.insert(moved);
					}
					Entry::Occupied(mut slot) => merge(slot.get_mut(), moved),
				}
			}
		}
		Ok(())
	}

	/// Makes the next [`Self::rename`] fail without touching the tree.
	#[cfg(test)]
	pub(crate) fn fail_next_rename(&mut self) {
		self.fail_next_rename = true;
	}
}

fn rekey(node: &mut BadgeNode, from: &BadgePath, to: &BadgePath, on_renamed: &mut impl FnMut(RenamedNode<'_>)) {
	for child in node.children.values_mut() {
		rekey(child, from, to, on_renamed);
	}
	let Some(new_path) = node.path.rebase(from, to) else {
		return;
	};
	on_renamed(RenamedNode {
		old_path: &node.path,
		new_path: &new_path,
		value: node.value,
		old_root: from,
		new_root: to,
	});
	node.path = new_path;
}

fn merge(dest: &mut BadgeNode, src: BadgeNode) {
	dest.value = src.value;
	for (key, child) in src.children {
		match dest.children.entry(key) {
			Entry::Vacant(slot) => {
				slot.insert(child);
			}
			Entry::Occupied(mut slot) => merge(slot.get_mut(), child),
		}
	}
}
