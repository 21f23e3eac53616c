use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use sigil_channel::EventSubType;
use sigil_primitives::{BadgePath, BadgeState};

use super::*;
use crate::test_support::{Note, RecordingChannel, RecordingFactory, add, remove, wait_for};

fn p(raw: &str) -> BadgePath {
	BadgePath::new(raw)
}

fn engine() -> (BadgeStateEngine, Arc<RecordingChannel>) {
	let channel = RecordingChannel::new();
	(BadgeStateEngine::new(p("/cloud"), channel.clone()), channel)
}

fn seed(engine: &BadgeStateEngine, entries: &[(&str, BadgeState)]) {
	for (path, state) in entries {
		engine.set_badge(&p(path), *state).expect("path is in scope");
	}
}

fn snapshot(engine: &BadgeStateEngine) -> Vec<(String, BadgeState)> {
	engine.snapshot().into_iter().map(|(path, state)| (path.to_string(), state)).collect()
}

fn stored(engine: &BadgeStateEngine) -> Vec<(String, BadgeState)> {
	engine.stored_badges().into_iter().map(|(path, state)| (path.to_string(), state)).collect()
}

#[test]
fn syncing_leaf_bubbles_to_ancestors() {
	let (engine, channel) = engine();
	engine.set_badge(&p("/cloud/a/b.txt"), BadgeState::Syncing).expect("in scope");

	assert_eq!(engine.find_effective_badge(&p("/cloud/a")), BadgeState::Syncing);
	assert_eq!(engine.find_effective_badge(&p("/cloud")), BadgeState::Syncing);
	assert_eq!(
		channel.take_notes(),
		vec![add(BadgeState::Syncing, "/cloud/a"), add(BadgeState::Syncing, "/cloud/a/b.txt")]
	);
}

#[test]
fn selective_suppresses_then_releases_subtree() {
	let (engine, channel) = engine();
	seed(&engine, &[("/cloud/a/b.txt", BadgeState::Syncing)]);
	channel.take();

	engine.set_badge(&p("/cloud/a"), BadgeState::SyncSelective).expect("in scope");
	assert_eq!(engine.find_effective_badge(&p("/cloud/a/b.txt")), BadgeState::None);
	assert_eq!(engine.find_effective_badge(&p("/cloud/a")), BadgeState::SyncSelective);
	assert_eq!(engine.find_effective_badge(&p("/cloud")), BadgeState::None);
	assert_eq!(
		channel.take_notes(),
		vec![remove("/cloud/a"), add(BadgeState::SyncSelective, "/cloud/a"), remove("/cloud/a/b.txt")]
	);
	assert_eq!(snapshot(&engine), vec![("/cloud/a".to_string(), BadgeState::SyncSelective)]);

	engine.set_badge(&p("/cloud/a"), BadgeState::None).expect("in scope");
	assert_eq!(
		channel.take_notes(),
		vec![
			remove("/cloud/a"),
			add(BadgeState::Syncing, "/cloud/a"),
			add(BadgeState::Syncing, "/cloud/a/b.txt"),
		]
	);
}

#[test]
fn pending_delete_keeps_path_syncing() {
	let (engine, _) = engine();
	seed(&engine, &[("/cloud/a/b.txt", BadgeState::Failed)]);

	assert!(engine.delete_badge_path(&p("/cloud/a/b.txt"), true).expect("in scope"));
	assert_eq!(engine.find_effective_badge(&p("/cloud/a/b.txt")), BadgeState::Syncing);
	assert_eq!(engine.find_effective_badge(&p("/cloud/a")), BadgeState::Syncing);
}

#[test]
fn peer_resync_replays_scope_and_snapshot() {
	let (engine, channel) = engine();
	seed(
		&engine,
		&[
			("/cloud/x.txt", BadgeState::Syncing),
			("/cloud/y.txt", BadgeState::Failed),
			("/cloud/z.txt", BadgeState::SyncSelective),
		],
	);
	channel.take();

	engine.on_peer_initialized();
	let notes = channel.take_notes();
	assert_eq!(notes.len(), 5);
	assert_eq!(notes[0], (EventSubType::RemoveScopeRoot, BadgeState::None, "/cloud".to_string()));
	assert_eq!(notes[1], (EventSubType::AddScopeRoot, BadgeState::None, "/cloud".to_string()));
	let mut adds: Vec<Note> = notes[2..].to_vec();
	adds.sort_by(|a, b| a.2.cmp(&b.2));
	assert_eq!(
		adds,
		vec![
			add(BadgeState::Syncing, "/cloud/x.txt"),
			add(BadgeState::Failed, "/cloud/y.txt"),
			add(BadgeState::SyncSelective, "/cloud/z.txt"),
		]
	);
}

#[test]
fn repeated_set_is_silent() {
	let (engine, channel) = engine();
	engine.set_badge(&p("/cloud/a.txt"), BadgeState::Syncing).expect("in scope");
	assert_eq!(channel.take().len(), 1);
	engine.set_badge(&p("/cloud/a.txt"), BadgeState::Syncing).expect("in scope");
	assert!(channel.take().is_empty());
}

#[test]
fn state_change_publishes_remove_then_add() {
	let (engine, channel) = engine();
	seed(&engine, &[("/cloud/a.txt", BadgeState::Syncing)]);
	channel.take();
	engine.set_badge(&p("/cloud/a.txt"), BadgeState::Failed).expect("in scope");
	assert_eq!(channel.take_notes(), vec![remove("/cloud/a.txt"), add(BadgeState::Failed, "/cloud/a.txt")]);
}

#[test]
fn failed_leaf_marks_ancestors_syncing() {
	let (engine, _) = engine();
	seed(&engine, &[("/cloud/a/b/c.txt", BadgeState::Failed)]);
	assert_eq!(
		snapshot(&engine),
		vec![
			("/cloud/a".to_string(), BadgeState::Syncing),
			("/cloud/a/b".to_string(), BadgeState::Syncing),
			("/cloud/a/b/c.txt".to_string(), BadgeState::Failed),
		]
	);
}

#[test]
fn delete_erases_subtree_from_snapshot() {
	let (engine, channel) = engine();
	seed(&engine, &[("/cloud/a/b.txt", BadgeState::Syncing), ("/cloud/a/c/d.txt", BadgeState::Failed)]);
	channel.take();

	assert!(engine.delete_badge_path(&p("/cloud/a"), false).expect("in scope"));
	assert_eq!(
		channel.take_notes(),
		vec![remove("/cloud/a/b.txt"), remove("/cloud/a/c/d.txt"), remove("/cloud/a/c"), remove("/cloud/a")]
	);
	assert!(snapshot(&engine).is_empty());
	assert!(stored(&engine).is_empty());
	assert!(!engine.delete_badge_path(&p("/cloud/a"), false).expect("in scope"));
}

#[test]
fn scope_root_is_never_published_as_a_badge() {
	let (engine, channel) = engine();
	engine.set_badge(&p("/cloud"), BadgeState::Failed).expect("in scope");
	assert_eq!(engine.find_effective_badge(&p("/cloud")), BadgeState::Failed);
	assert!(channel.take().is_empty());
	assert!(snapshot(&engine).is_empty());

	engine.set_badge(&p("/cloud/a.txt"), BadgeState::Syncing).expect("in scope");
	assert_eq!(channel.take_notes(), vec![add(BadgeState::Syncing, "/cloud/a.txt")]);

	assert!(engine.delete_badge_path(&p("/cloud"), false).expect("in scope"));
	assert_eq!(channel.take_notes(), vec![remove("/cloud/a.txt")]);
	assert!(snapshot(&engine).is_empty());
	assert!(stored(&engine).is_empty());
}

#[test]
fn out_of_scope_paths_are_rejected_and_never_badged() {
	let (engine, channel) = engine();
	assert!(matches!(
		engine.set_badge(&p("/elsewhere/a"), BadgeState::Failed),
		Err(EngineError::OutOfScope { .. })
	));
	assert!(matches!(
		engine.rename_badge_path(&p("/elsewhere/a"), &p("/elsewhere/b")),
		Err(EngineError::OutOfScope { .. })
	));
	assert_eq!(engine.find_effective_badge(&p("/elsewhere/a")), BadgeState::None);
	assert!(channel.take().is_empty());
}

#[test]
fn rename_moves_badges_and_notifications() {
	let (engine, channel) = engine();
	seed(&engine, &[("/cloud/src/a.txt", BadgeState::Syncing), ("/cloud/src/sub/b.txt", BadgeState::Failed)]);
	channel.take();

	engine.rename_badge_path(&p("/cloud/src"), &p("/cloud/dst")).expect("rename succeeds");
	assert_eq!(
		stored(&engine),
		vec![
			("/cloud/dst/a.txt".to_string(), BadgeState::Syncing),
			("/cloud/dst/sub/b.txt".to_string(), BadgeState::Failed),
		]
	);
	assert_eq!(
		snapshot(&engine),
		vec![
			("/cloud/dst".to_string(), BadgeState::Syncing),
			("/cloud/dst/a.txt".to_string(), BadgeState::Syncing),
			("/cloud/dst/sub".to_string(), BadgeState::Syncing),
			("/cloud/dst/sub/b.txt".to_string(), BadgeState::Failed),
		]
	);
	let notes = channel.take_notes();
	assert!(notes.contains(&remove("/cloud/src")));
	assert!(notes.contains(&add(BadgeState::Failed, "/cloud/dst/sub/b.txt")));
}

#[test]
fn rename_of_missing_source_is_an_error() {
	let (engine, _) = engine();
	let err = engine.rename_badge_path(&p("/cloud/nope"), &p("/cloud/dst")).expect_err("nothing to move");
	assert!(matches!(err, EngineError::Store(RenameError::SourceMissing(_))));
}

#[test]
fn rename_out_of_scope_deletes_and_into_scope_recomputes() {
	let (engine, channel) = engine();
	seed(&engine, &[("/cloud/a/b.txt", BadgeState::Syncing)]);
	channel.take();

	engine.rename_badge_path(&p("/cloud/a"), &p("/trash/a")).expect("leaving scope");
	assert!(stored(&engine).is_empty());
	assert_eq!(channel.take_notes(), vec![remove("/cloud/a/b.txt"), remove("/cloud/a")]);

	engine.rename_badge_path(&p("/trash/a"), &p("/cloud/a")).expect("entering scope");
	assert!(channel.take().is_empty());
}

fn recovery_fixture() -> (BadgeStateEngine, Arc<RecordingChannel>) {
	let (engine, channel) = engine();
	seed(
		&engine,
		&[
			("/cloud/src", BadgeState::Syncing),
			("/cloud/src/a.txt", BadgeState::Failed),
			("/cloud/src/deep/er/b.txt", BadgeState::Syncing),
			("/cloud/src/sel", BadgeState::SyncSelective),
			("/cloud/src/sel/hidden.txt", BadgeState::Failed),
			("/cloud/dst/keep.txt", BadgeState::Syncing),
		],
	);
	channel.take();
	(engine, channel)
}

#[test]
fn fallback_rename_matches_native_rename() {
	let (native, native_channel) = recovery_fixture();
	let (fallback, fallback_channel) = recovery_fixture();

	native.rename_badge_path(&p("/cloud/src"), &p("/cloud/dst/moved")).expect("native rename");
	fallback.fail_next_store_rename();
	fallback.rename_badge_path(&p("/cloud/src"), &p("/cloud/dst/moved")).expect("fallback rename");

	assert_eq!(stored(&fallback), stored(&native));
	assert_eq!(snapshot(&fallback), snapshot(&native));
	assert_eq!(fallback_channel.take_notes(), native_channel.take_notes());
}

#[test]
fn publish_failures_do_not_roll_back() {
	let (engine, channel) = engine();
	channel.set_fail_publish(true);
	engine.set_badge(&p("/cloud/a.txt"), BadgeState::Failed).expect("store accepts the change");
	assert_eq!(engine.find_effective_badge(&p("/cloud/a.txt")), BadgeState::Failed);
	assert_eq!(snapshot(&engine), vec![("/cloud/a.txt".to_string(), BadgeState::Failed)]);
	assert!(channel.take().is_empty());

	channel.set_fail_publish(false);
	engine.on_peer_initialized();
	assert!(channel.take_notes().contains(&add(BadgeState::Failed, "/cloud/a.txt")));
}

#[test]
fn shutdown_rejects_mutations() {
	let (engine, channel) = engine();
	engine.shutdown();
	engine.shutdown();
	assert!(engine.is_shut_down());
	assert!(channel.is_terminated());
	assert!(matches!(
		engine.set_badge(&p("/cloud/a"), BadgeState::Syncing),
		Err(EngineError::ShutDown)
	));
}

fn fast_engine_config() -> EngineConfig {
	EngineConfig {
		scope: p("/cloud"),
		supervisor: SupervisorConfig {
			poll_interval: Duration::from_millis(10),
			watchdog_interval: Duration::from_millis(100),
			startup_timeout: Duration::from_secs(2),
			kill_retries: 10,
			kill_retry_delay: Duration::from_millis(10),
		},
		channel_init_timeout: Duration::from_secs(2),
	}
}

#[test]
fn start_seeds_initial_list_and_supervises() {
	let factory = RecordingFactory::new();
	let engine = BadgeStateEngine::start(
		fast_engine_config(),
		factory.clone(),
		[(p("/cloud/a.txt"), BadgeState::Syncing), (p("/outside"), BadgeState::Failed)],
	)
	.expect("engine starts");

	assert_eq!(snapshot(&engine), vec![("/cloud/a.txt".to_string(), BadgeState::Syncing)]);
	assert_eq!(engine.supervisor_id(), Some(1));
	assert_eq!(factory.opened().len(), 2);
	let records = engine.worker_records();
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].name, "overlay.subscriber");
	engine.shutdown();
	assert!(factory.opened().iter().all(|channel| channel.is_terminated()));
}

#[test]
fn supervision_failure_rebuilds_and_resyncs() {
	let factory = RecordingFactory::new();
	let engine = BadgeStateEngine::start(fast_engine_config(), factory.clone(), [(p("/cloud/a.txt"), BadgeState::Failed)]).expect("engine starts");
	let publisher = Arc::clone(&factory.opened()[0]);
	publisher.take();

	engine.fail_supervisor_watchdog();
	assert!(wait_for(Duration::from_secs(5), || engine.supervisor_id() == Some(2)));
	assert!(wait_for(Duration::from_secs(5), || {
		publisher.messages().iter().any(|m| m.sub_type == EventSubType::AddBadgePath)
	}));

	let opened = factory.opened();
	assert_eq!(opened.len(), 3);
	assert!(opened[1].is_terminated());
	assert!(!opened[2].is_terminated());
	let notes = publisher.take_notes();
	assert_eq!(notes[0].0, EventSubType::RemoveScopeRoot);
	assert_eq!(notes[1].0, EventSubType::AddScopeRoot);
	assert_eq!(notes[2], add(BadgeState::Failed, "/cloud/a.txt"));

	engine.on_supervision_failed(1, "stale report");
	assert_eq!(engine.supervisor_id(), Some(2));
}

fn arb_subtree() -> impl Strategy<Value = Vec<(String, BadgeState)>> {
	let segment = prop_oneof![Just("a"), Just("b"), Just("c.txt")];
	let path = proptest::collection::vec(segment, 1..4).prop_map(|segs| segs.join("/"));
	let state = prop_oneof![
		Just(BadgeState::None),
		Just(BadgeState::Syncing),
		Just(BadgeState::Failed),
		Just(BadgeState::SyncSelective),
	];
	proptest::collection::vec((path, state), 1..10)
}

proptest! {
	#[test]
	fn rename_preserves_effective_badges(subtree in arb_subtree(), fail_native in any::<bool>()) {
		let (engine, _) = engine();
		for (rel, state) in &subtree {
			engine.set_badge(&p(&format!("/cloud/src/{rel}")), *state).expect("in scope");
		}
		let from = p("/cloud/src");
		let to = p("/cloud/other/dst");
		let before: Vec<(BadgePath, BadgeState)> = subtree
			.iter()
			.map(|(rel, _)| {
				let path = from.join(rel);
				let state = engine.find_effective_badge(&path);
				(path, state)
			})
			.collect();

		if fail_native {
			engine.fail_next_store_rename();
		}
		engine.rename_badge_path(&from, &to).expect("rename succeeds");

		for (old, state) in before {
			let new = old.rebase(&from, &to).expect("old path is under from");
			prop_assert_eq!(engine.find_effective_badge(&new), state);
		}
		prop_assert!(engine.stored_badges().iter().all(|(path, _)| !path.starts_with(&from)));
		prop_assert!(engine.snapshot().iter().all(|(path, _)| !path.starts_with(&from)));
	}
}
