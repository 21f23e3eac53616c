//! Sigil overlay daemon.
//!
//! Runs one badge engine on an in-process channel hub together with a local
//! peer mirror, and drives both from line commands on stdin:
//!
//! ```text
//! set <path> <state>
//! delete <path> [pending]
//! rename <from> <to>
//! query <path>
//! peer
//! quit
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sigil_channel::ChannelFactory;
use sigil_overlay::{BadgeRequestQueue, OverlayConfig, OverlayService, PeerMirror};
use sigil_primitives::{BadgePath, BadgeState};
use sigil_worker::TaskClass;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const PEER_POLL: Duration = Duration::from_millis(50);

/// Daemon command line arguments.
#[derive(Parser, Debug)]
#[command(name = "sigil-overlayd")]
#[command(about = "Badge overlay engine driven from stdin")]
struct Args {
	/// TOML configuration file
	#[arg(short, long, value_name = "PATH")]
	config: Option<PathBuf>,

	/// Scope root, overriding the configuration file
	#[arg(short, long, value_name = "PATH")]
	root: Option<String>,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();
	setup_tracing(args.verbose);

	let mut config = match &args.config {
		Some(path) => OverlayConfig::load(path)?,
		None => OverlayConfig::default(),
	};
	if let Some(root) = args.root {
		config.root = root;
	}
	config.validate()?;
	info!(root = %config.root, channel = %config.channel.name, "starting sigil-overlayd");

	let (service, factory) = OverlayService::start_local(&config)?;
	let peer = Arc::new(PeerMirror::new(factory.open()?));
	peer.announce()?;

	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	let mut stdout = tokio::io::stdout();
	while let Some(line) = lines.next_line().await? {
		let reply = match Command::parse(&line) {
			Ok(None) => continue,
			Ok(Some(Command::Quit)) => break,
			Ok(Some(command)) => run_command(&service, &peer, command).await,
			Err(err) => format!("error: {err}"),
		};
		stdout.write_all(reply.as_bytes()).await?;
		stdout.write_all(b"\n").await?;
		stdout.flush().await?;
	}

	let drained = {
		let service = Arc::clone(&service);
		sigil_worker::spawn_blocking(TaskClass::Drain, move || service.shutdown(DRAIN_TIMEOUT)).await?
	};
	if !drained {
		tracing::warn!("shutting down with queued requests");
	}
	peer.close();
	info!("sigil-overlayd stopped");
	Ok(())
}

fn setup_tracing(verbose: bool) {
	use tracing_subscriber::EnvFilter;

	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
	tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// One parsed stdin line.
#[derive(Debug, PartialEq, Eq)]
enum Command {
	Set(BadgePath, BadgeState),
	Delete(BadgePath, bool),
	Rename(BadgePath, BadgePath),
	Query(BadgePath),
	Peer,
	Quit,
}

impl Command {
	/// Parses one line. Blank lines and `#` comments yield `None`.
	fn parse(line: &str) -> Result<Option<Self>, String> {
		let mut words = line.split_whitespace();
		let Some(verb) = words.next() else {
			return Ok(None);
		};
		if verb.starts_with('#') {
			return Ok(None);
		}
		let args: Vec<&str> = words.collect();
		let command = match (verb, args.as_slice()) {
			("set", [path, state]) => Self::Set(BadgePath::new(path), state.parse().map_err(|e| format!("{e}"))?),
			("delete", [path]) => Self::Delete(BadgePath::new(path), false),
			("delete", [path, "pending"]) => Self::Delete(BadgePath::new(path), true),
			("rename", [from, to]) => Self::Rename(BadgePath::new(from), BadgePath::new(to)),
			("query", [path]) => Self::Query(BadgePath::new(path)),
			("peer", []) => Self::Peer,
			("quit" | "exit", []) => Self::Quit,
			("set" | "delete" | "rename" | "query" | "peer", _) => return Err(format!("wrong arguments for {verb}")),
			_ => return Err(format!("unknown command {verb:?}")),
		};
		Ok(Some(command))
	}
}

/// Runs one command on the blocking pool. Queries wait for the drain and
/// peer polls park, so neither may run on a runtime worker.
async fn run_command(service: &Arc<OverlayService>, peer: &Arc<PeerMirror>, command: Command) -> String {
	let (service, peer) = (Arc::clone(service), Arc::clone(peer));
	match sigil_worker::spawn_blocking(TaskClass::Drain, move || execute(&service, &peer, command)).await {
		Ok(reply) => reply,
		Err(err) => format!("error: {err}"),
	}
}

/// Waits for queued requests to apply. A timeout is logged and the caller
/// answers from whatever state has been applied so far.
fn settle(queue: &BadgeRequestQueue) {
	if !queue.wait_idle(DRAIN_TIMEOUT) {
		tracing::warn!(timeout = ?DRAIN_TIMEOUT, pending = queue.len(), "overlayd.drain_timeout");
	}
}

fn execute(service: &OverlayService, peer: &PeerMirror, command: Command) -> String {
	let queue = service.queue();
	let queued = match command {
		Command::Set(path, state) => queue.set_badge(path, state),
		Command::Delete(path, pending) => queue.delete_badge_path(path, pending),
		Command::Rename(from, to) => queue.rename_badge_path(from, to),
		Command::Query(path) => {
			settle(queue);
			return format!("{path} {}", service.find_effective_badge(&path));
		}
		Command::Peer => {
			settle(queue);
			if let Err(err) = peer.poll(PEER_POLL) {
				return format!("error: {err}");
			}
			let badges = peer.badges();
			if badges.is_empty() {
				return "(no badges)".to_string();
			}
			return badges.iter().map(|(path, state)| format!("{path} {state}")).collect::<Vec<_>>().join("\n");
		}
		Command::Quit => return String::new(),
	};
	match queued {
		Ok(_) => "ok".to_string(),
		Err(err) => format!("error: {err}"),
	}
}
