// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! `loom-bridge` binary: drives one agent session from a terminal.

mod args;
mod terminal;
mod view;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use loom_bridge::{
	default_config_path, Attachment, BridgeConfig, Session, SessionBridge, SessionSettings, TomlSettingsStore,
	TurnResult,
};
use loom_bridge_permission::PermissionRequest;
use loom_bridge_runtime::RuntimeLocator;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use args::{Args, Command, RuntimeCommand, SessionArgs};
use terminal::TerminalSurface;
use view::TerminalSink;

type InputLines = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	init_tracing(args.log_json);

	let mut config = BridgeConfig::load(args.config.as_deref()).context("loading bridge config")?;
	args.apply_overrides(&mut config);

	let (surface, prompts) = TerminalSurface::new();
	let bridge = SessionBridge::from_config(config, Arc::new(surface))?;

	match args.command {
		Command::Runtime(command) => runtime(&bridge, command).await,
		Command::Send(send) => {
			let session = open_session(&bridge, &send.session)?;
			let attachments = send
				.attachments
				.iter()
				.map(|path| Attachment::from_file(path).with_context(|| format!("reading {}", path.display())))
				.collect::<anyhow::Result<Vec<_>>>()?;
			let mut input = BufReader::new(tokio::io::stdin()).lines();
			let mut prompts = prompts;
			let text = send.text.join(" ");
			let result = drive_turn(&bridge, &session, text, attachments, &mut prompts, &mut input).await?;
			if !result.success {
				std::process::exit(1);
			}
			Ok(())
		}
		Command::Chat(chat) => {
			let session = open_session(&bridge, &chat)?;
			chat_loop(&bridge, &session, prompts).await
		}
	}
}

fn init_tracing(json: bool) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let builder = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr);
	if json {
		builder.json().init();
	} else {
		builder.init();
	}
}

fn settings_path() -> anyhow::Result<PathBuf> {
	Ok(default_config_path()?.with_file_name("bridge-settings.toml"))
}

fn open_session(bridge: &SessionBridge, args: &SessionArgs) -> anyhow::Result<Session> {
	let store = TomlSettingsStore::open(settings_path()?)?;
	let mut settings = SessionSettings::load(&store, args.provider);
	args.apply(&mut settings);
	if args.save {
		settings.save(&store)?;
		info!(path = %store.path().display(), "saved session settings");
	}

	let session = bridge.create_session(args.provider, settings);
	session.set_sink(Arc::new(TerminalSink::new(bridge.config().throttle_interval())));
	info!(session_id = %session.id(), provider = %args.provider, "session ready");
	Ok(session)
}

async fn runtime(bridge: &SessionBridge, command: RuntimeCommand) -> anyhow::Result<()> {
	let Some(gate) = bridge.runtime_gate() else {
		bail!("runtime_dir is configured; there is no bundle to manage");
	};
	match command {
		RuntimeCommand::Prepare => {
			let dir = gate.acquire().await?;
			println!("{}", dir.display());
		}
		RuntimeCommand::Clear => {
			if !gate.clear() {
				bail!("runtime extraction in progress; try again once it finishes");
			}
			println!("cleared {}", gate.source().target_dir().display());
		}
		RuntimeCommand::Status => {
			println!("state: {:?}", gate.state());
			match gate.find_runtime_dir() {
				Some(dir) => println!("runtime: {}", dir.display()),
				None => println!("runtime: not extracted"),
			}
		}
	}
	Ok(())
}

async fn chat_loop(
	bridge: &SessionBridge,
	session: &Session,
	mut prompts: UnboundedReceiver<PermissionRequest>,
) -> anyhow::Result<()> {
	let mut input = BufReader::new(tokio::io::stdin()).lines();
	eprintln!("type a message, /restart to start over, /quit to exit");
	while let Some(line) = input.next_line().await? {
		let line = line.trim().to_string();
		match line.as_str() {
			"" => continue,
			"/quit" => break,
			"/restart" => {
				bridge.restart(session);
				eprintln!("conversation restarted");
				continue;
			}
			_ => {}
		}
		match drive_turn(bridge, session, line, Vec::new(), &mut prompts, &mut input).await {
			Ok(_) => {}
			Err(e) => eprintln!("error: {e:#}"),
		}
	}
	bridge.close_session(session.id())?;
	Ok(())
}

/// Run one turn while answering permission prompts from stdin. Ctrl-C or
/// `/stop` interrupts the turn.
async fn drive_turn(
	bridge: &SessionBridge,
	session: &Session,
	text: String,
	attachments: Vec<Attachment>,
	prompts: &mut UnboundedReceiver<PermissionRequest>,
	input: &mut InputLines,
) -> anyhow::Result<TurnResult> {
	let turn = {
		let bridge = bridge.clone();
		let session = session.clone();
		tokio::spawn(async move { bridge.send_turn(&session, text, attachments).await })
	};
	tokio::pin!(turn);

	let mut pending: VecDeque<PermissionRequest> = VecDeque::new();
	let mut stdin_open = true;
	loop {
		tokio::select! {
			joined = &mut turn => return Ok(joined.context("turn task failed")??),
			Some(request) = prompts.recv() => {
				eprintln!("{}", terminal::describe(&request));
				pending.push_back(request);
			}
			line = input.next_line(), if stdin_open => {
				let Some(line) = line? else {
					stdin_open = false;
					continue;
				};
				if line.trim() == "/stop" {
					bridge.interrupt(session);
					continue;
				}
				let Some(request) = pending.front() else {
					warn!("turn in progress; type /stop to interrupt");
					continue;
				};
				match terminal::parse_answer(request, &line) {
					Some(decision) => {
						if !bridge.resolve_permission(&request.channel_id, decision) {
							eprintln!("prompt already resolved");
						}
						pending.pop_front();
					}
					None => eprintln!("{}", terminal::describe(request)),
				}
			}
			_ = tokio::signal::ctrl_c() => {
				bridge.interrupt(session);
			}
		}
	}
}
