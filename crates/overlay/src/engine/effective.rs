//! Read-side badge resolution.

use sigil_primitives::{BadgePath, BadgeState};

use crate::store::{BadgeNode, BadgeStore};

/// Effective badge of `path` given everything stored under `scope`.
///
/// Resolution order:
/// 1. outside `scope`: [`BadgeState::None`];
/// 2. an explicit [`BadgeState::SyncSelective`] on any strict ancestor inside
///    the scope (the scope root included) suppresses to `None`, even over an
///    explicit value at `path`;
/// 3. an explicit value at `path` wins;
/// 4. otherwise the first child, in key order, that contributes a badge
///    decides. Children resolve recursively with the same rule.
pub fn effective_badge(store: &BadgeStore, scope: &BadgePath, path: &BadgePath) -> BadgeState {
	if !path.starts_with(scope) {
		return BadgeState::None;
	}

	let lineage = store.lineage(path);
	let Some(node) = lineage.last().filter(|node| node.path() == path) else {
		return BadgeState::None;
	};
	let suppressed = lineage[..lineage.len() - 1]
		.iter()
		.filter(|ancestor| ancestor.path().starts_with(scope))
		.any(|ancestor| ancestor.value() == Some(BadgeState::SyncSelective));
	if suppressed {
		return BadgeState::None;
	}

	match node.value() {
		Some(value) => value,
		None => bubbled(node).unwrap_or(BadgeState::None),
	}
}

/// Badge a valueless node inherits from its subtree, if any.
fn bubbled(node: &BadgeNode) -> Option<BadgeState> {
	node.children().find_map(contribution)
}

/// What one child pushes up to its parent.
fn contribution(child: &BadgeNode) -> Option<BadgeState> {
	match child.value() {
		Some(BadgeState::Failed | BadgeState::Syncing) => Some(BadgeState::Syncing),
		Some(BadgeState::None | BadgeState::SyncSelective) => None,
		None => bubbled(child),
	}
}
