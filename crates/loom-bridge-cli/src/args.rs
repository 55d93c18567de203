// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use loom_bridge::{BridgeConfig, PermissionMode, ProviderKind, SessionSettings};

/// Loom bridge - run agent turns from a terminal.
#[derive(Parser, Debug)]
#[command(name = "loom-bridge", about = "Drive an agent session from the terminal", version)]
pub struct Args {
	/// Config file (defaults to $XDG_CONFIG_HOME/loom/bridge.toml)
	#[arg(long, global = true, env = "LOOM_BRIDGE_CONFIG")]
	pub config: Option<PathBuf>,

	/// Emit logs as JSON
	#[arg(long, global = true)]
	pub log_json: bool,

	/// Unpacked runtime directory, bypassing bundle extraction
	#[arg(long, global = true)]
	pub runtime_dir: Option<PathBuf>,

	/// Node executable used to start the bridge
	#[arg(long, global = true)]
	pub node_path: Option<String>,

	#[command(subcommand)]
	pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
	/// Interactive chat session
	Chat(SessionArgs),
	/// Run a single turn and print the reply
	Send(SendArgs),
	/// Manage the unpacked bridge runtime
	#[command(subcommand)]
	Runtime(RuntimeCommand),
}

#[derive(Subcommand, Debug)]
pub enum RuntimeCommand {
	/// Extract the bundle now
	Prepare,
	/// Remove the extracted runtime
	Clear,
	/// Show extraction state
	Status,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct SessionArgs {
	/// Agent backend
	#[arg(long, default_value = "claude")]
	pub provider: ProviderKind,

	/// Permission mode (default, acceptEdits, plan, bypassPermissions)
	#[arg(long)]
	pub mode: Option<PermissionMode>,

	#[arg(long)]
	pub model: Option<String>,

	/// Working directory for the agent
	#[arg(long)]
	pub cwd: Option<PathBuf>,

	#[arg(long)]
	pub reasoning_effort: Option<String>,

	/// Role instructions for the agent
	#[arg(long)]
	pub system_prompt: Option<String>,

	/// Persist the resulting settings as the new defaults
	#[arg(long)]
	pub save: bool,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct SendArgs {
	#[command(flatten)]
	pub session: SessionArgs,

	/// File to attach (repeatable)
	#[arg(long = "attach")]
	pub attachments: Vec<PathBuf>,

	/// Message text
	#[arg(required = true)]
	pub text: Vec<String>,
}

impl Args {
	/// Flags take precedence over the file and environment.
	pub fn apply_overrides(&self, config: &mut BridgeConfig) {
		if let Some(dir) = &self.runtime_dir {
			config.runtime_dir = Some(dir.clone());
		}
		if let Some(node) = &self.node_path {
			config.node_path = node.clone();
		}
	}
}

impl SessionArgs {
	pub fn apply(&self, settings: &mut SessionSettings) {
		if let Some(mode) = self.mode {
			settings.permission_mode = mode;
		}
		if let Some(model) = &self.model {
			settings.model = model.clone();
		}
		if let Some(cwd) = &self.cwd {
			settings.working_directory = Some(cwd.clone());
		}
		if let Some(effort) = &self.reasoning_effort {
			settings.reasoning_effort = Some(effort.clone());
		}
		if let Some(prompt) = &self.system_prompt {
			settings.system_prompt = Some(prompt.clone());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_send_parses_session_flags() {
		let args = Args::parse_from([
			"loom-bridge",
			"send",
			"--provider",
			"codex",
			"--mode",
			"bypassPermissions",
			"--attach",
			"a.png",
			"list",
			"files",
		]);
		let Command::Send(send) = args.command else {
			panic!("expected send");
		};
		assert_eq!(send.session.provider, ProviderKind::Codex);
		assert_eq!(send.session.mode, Some(PermissionMode::BypassPermissions));
		assert_eq!(send.attachments, vec![PathBuf::from("a.png")]);
		assert_eq!(send.text.join(" "), "list files");
	}

	#[test]
	fn test_flags_override_config() {
		let args = Args::parse_from(["loom-bridge", "--runtime-dir", "/opt/bridge", "runtime", "status"]);
		let mut config = BridgeConfig::default();
		args.apply_overrides(&mut config);
		assert_eq!(config.runtime_dir, Some(PathBuf::from("/opt/bridge")));
		assert_eq!(config.node_path, "node");
	}

	#[test]
	fn test_session_args_apply() {
		let args = Args::parse_from(["loom-bridge", "chat", "--cwd", "/work", "--model", "opus"]);
		let Command::Chat(chat) = args.command else {
			panic!("expected chat");
		};
		let mut settings = SessionSettings::for_provider(ProviderKind::Claude);
		chat.apply(&mut settings);
		assert_eq!(settings.working_directory, Some(PathBuf::from("/work")));
		assert_eq!(settings.model, "opus");
		assert_eq!(settings.permission_mode, PermissionMode::Default);
	}
}
