// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Environment assembly for agent processes.
//!
//! Layers, later ones winning: the inherited environment, an augmented
//! `PATH`, a per-turn temp directory, provider variables, then resolved
//! credentials.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use loom_bridge_protocol::PermissionMode;
use tracing::{debug, warn};

use crate::provider::{Platform, ProviderKind};
use crate::secrets::SecretString;

pub const TMP_DIR_VAR: &str = "LOOM_BRIDGE_TMP_DIR";
pub const PERMISSION_DIR_VAR: &str = "LOOM_BRIDGE_PERMISSION_DIR";
pub const CHANNEL_ID_VAR: &str = "LOOM_BRIDGE_CHANNEL_ID";
pub const PROVIDER_VAR: &str = "LOOM_BRIDGE_PROVIDER";

/// Install locations for node and friends that a GUI-launched process
/// usually misses.
pub fn runtime_path_candidates(home: Option<&Path>) -> Vec<PathBuf> {
	let mut dirs = vec![
		PathBuf::from("/usr/local/bin"),
		PathBuf::from("/opt/homebrew/bin"),
	];
	if let Some(home) = home {
		dirs.push(home.join(".bun/bin"));
		dirs.push(home.join(".volta/bin"));
		dirs.push(home.join(".local/bin"));
		if let Some(nvm) = newest_nvm_bin(home) {
			dirs.push(nvm);
		}
	}
	dirs
}

fn parse_version(name: &str) -> Option<Vec<u64>> {
	name
		.strip_prefix('v')
		.unwrap_or(name)
		.split('.')
		.map(|part| part.parse().ok())
		.collect()
}

/// `~/.nvm/versions/node/<newest>/bin`, if any version is installed.
fn newest_nvm_bin(home: &Path) -> Option<PathBuf> {
	let root = home.join(".nvm/versions/node");
	let entries = std::fs::read_dir(&root).ok()?;
	entries
		.filter_map(Result::ok)
		.filter_map(|entry| {
			let name = entry.file_name().to_string_lossy().into_owned();
			parse_version(&name).map(|version| (version, entry.path()))
		})
		.max_by(|a, b| a.0.cmp(&b.0))
		.map(|(_, path)| path.join("bin"))
}

/// Append existing candidate directories not already on `existing`.
pub fn augment_path(existing: Option<&str>, candidates: &[PathBuf]) -> String {
	let mut entries: Vec<PathBuf> = existing
		.map(|p| std::env::split_paths(p).collect())
		.unwrap_or_default();
	for dir in candidates {
		if dir.is_dir() && !entries.iter().any(|e| e == dir) {
			entries.push(dir.clone());
		}
	}
	match std::env::join_paths(&entries) {
		Ok(joined) => joined.to_string_lossy().into_owned(),
		Err(e) => {
			warn!(error = %e, "could not join PATH entries, keeping inherited PATH");
			existing.unwrap_or_default().to_string()
		}
	}
}

/// Per-turn identifiers and settings the environment depends on.
#[derive(Debug, Clone)]
pub struct TurnContext<'a> {
	pub session_id: &'a str,
	pub channel_id: &'a str,
	pub provider: ProviderKind,
	pub permission_mode: PermissionMode,
	pub permission_dir: Option<&'a Path>,
}

/// The variables for one process and the temp directory they point at.
#[derive(Debug, Clone)]
pub struct TurnEnvironment {
	pub vars: BTreeMap<String, String>,
	pub temp_dir: PathBuf,
}

impl TurnEnvironment {
	pub fn get(&self, key: &str) -> Option<&str> {
		self.vars.get(key).map(String::as_str)
	}
}

#[derive(Debug, Clone)]
pub struct EnvironmentBuilder {
	inherited: BTreeMap<String, String>,
	path_candidates: Vec<PathBuf>,
	temp_root: PathBuf,
	platform: Platform,
	secrets: BTreeMap<String, SecretString>,
}

impl EnvironmentBuilder {
	pub fn new(inherited: BTreeMap<String, String>, temp_root: impl Into<PathBuf>) -> Self {
		Self {
			inherited,
			path_candidates: Vec::new(),
			temp_root: temp_root.into(),
			platform: Platform::current(),
			secrets: BTreeMap::new(),
		}
	}

	/// Builder seeded from the current process environment.
	pub fn from_process(temp_root: impl Into<PathBuf>, extra_path_dirs: &[PathBuf]) -> Self {
		let inherited = std::env::vars_os()
			.filter_map(|(k, v)| Some((os_to_string(k)?, os_to_string(v)?)))
			.collect();
		let mut candidates = extra_path_dirs.to_vec();
		candidates.extend(runtime_path_candidates(dirs::home_dir().as_deref()));
		Self::new(inherited, temp_root).with_path_candidates(candidates)
	}

	pub fn with_path_candidates(mut self, candidates: Vec<PathBuf>) -> Self {
		self.path_candidates = candidates;
		self
	}

	pub fn with_platform(mut self, platform: Platform) -> Self {
		self.platform = platform;
		self
	}

	pub fn with_secrets(mut self, secrets: BTreeMap<String, SecretString>) -> Self {
		self.secrets = secrets;
		self
	}

	pub fn platform(&self) -> Platform {
		self.platform
	}

	/// `PATH` as handed to children; also used to locate the executable.
	pub fn search_path(&self) -> String {
		augment_path(self.inherited.get("PATH").map(String::as_str), &self.path_candidates)
	}

	pub fn temp_dir_for(&self, session_id: &str, channel_id: &str) -> PathBuf {
		self
			.temp_root
			.join("loom-bridge")
			.join(session_id)
			.join(channel_id)
	}

	pub fn build(&self, ctx: &TurnContext<'_>) -> TurnEnvironment {
		let mut vars = self.inherited.clone();
		vars.insert("PATH".to_string(), self.search_path());

		let temp_dir = self.temp_dir_for(ctx.session_id, ctx.channel_id);
		let temp = temp_dir.to_string_lossy().into_owned();
		for key in ["TMPDIR", "TEMP", "TMP", TMP_DIR_VAR] {
			vars.insert(key.to_string(), temp.clone());
		}

		for (key, value) in ctx.provider.env_vars(ctx.permission_mode, self.platform) {
			vars.insert(key.to_string(), value);
		}
		vars.insert(PROVIDER_VAR.to_string(), ctx.provider.as_str().to_string());
		vars.insert(CHANNEL_ID_VAR.to_string(), ctx.channel_id.to_string());
		if let Some(dir) = ctx.permission_dir {
			vars.insert(PERMISSION_DIR_VAR.to_string(), dir.to_string_lossy().into_owned());
		}

		for (name, value) in &self.secrets {
			vars.insert(name.clone(), value.expose().to_string());
		}

		debug!(
			provider = %ctx.provider,
			channel_id = %ctx.channel_id,
			var_count = vars.len(),
			secret_count = self.secrets.len(),
			"built turn environment"
		);
		TurnEnvironment { vars, temp_dir }
	}
}

fn os_to_string(value: OsString) -> Option<String> {
	value.into_string().ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ctx<'a>(provider: ProviderKind, mode: PermissionMode, permission_dir: Option<&'a Path>) -> TurnContext<'a> {
		TurnContext {
			session_id: "s1",
			channel_id: "c1",
			provider,
			permission_mode: mode,
			permission_dir,
		}
	}

	#[cfg(unix)]
	#[test]
	fn test_augment_path_appends_existing_dirs_once() {
		let dir = tempfile::tempdir().unwrap();
		let present = dir.path().join("bin");
		std::fs::create_dir(&present).unwrap();
		let absent = dir.path().join("missing");

		let existing = format!("/usr/bin:{}", present.display());
		let path = augment_path(Some(&existing), &[present.clone(), absent]);
		assert_eq!(path, existing);

		let path = augment_path(Some("/usr/bin"), &[present.clone()]);
		assert_eq!(path, format!("/usr/bin:{}", present.display()));
	}

	#[test]
	fn test_newest_nvm_version_wins() {
		let home = tempfile::tempdir().unwrap();
		for version in ["v18.20.1", "v20.9.0", "v20.10.0", "not-a-version"] {
			std::fs::create_dir_all(home.path().join(".nvm/versions/node").join(version).join("bin")).unwrap();
		}
		let candidates = runtime_path_candidates(Some(home.path()));
		assert_eq!(
			candidates.last().unwrap(),
			&home.path().join(".nvm/versions/node/v20.10.0/bin")
		);
	}

	/// **Test: Codex bypass mode environment**
	///
	/// A bypass-permissions turn on a sandbox-capable platform must run with
	/// a workspace-write sandbox and no approvals, plus the bridge's own
	/// routing variables and a private temp directory.
	#[test]
	fn test_codex_bypass_environment() {
		let builder = EnvironmentBuilder::new(
			BTreeMap::from([("PATH".to_string(), "/usr/bin".to_string())]),
			"/scratch",
		)
		.with_platform(Platform::Sandboxed);
		let perm = PathBuf::from("/scratch/perm/s1");
		let env = builder.build(&ctx(ProviderKind::Codex, PermissionMode::BypassPermissions, Some(&perm)));

		assert_eq!(env.get("CODEX_SANDBOX_MODE"), Some("workspace-write"));
		assert_eq!(env.get("CODEX_APPROVAL_POLICY"), Some("never"));
		assert_eq!(env.get(PROVIDER_VAR), Some("codex"));
		assert_eq!(env.get(CHANNEL_ID_VAR), Some("c1"));
		assert_eq!(env.get(PERMISSION_DIR_VAR), Some("/scratch/perm/s1"));
		assert_eq!(env.temp_dir, PathBuf::from("/scratch/loom-bridge/s1/c1"));
		for key in ["TMPDIR", "TEMP", "TMP", TMP_DIR_VAR] {
			assert_eq!(env.get(key), Some("/scratch/loom-bridge/s1/c1"));
		}
		assert!(env.get("CLAUDE_PERMISSION_MODE").is_none());
	}

	#[test]
	fn test_secrets_override_inherited() {
		let builder = EnvironmentBuilder::new(
			BTreeMap::from([("ANTHROPIC_API_KEY".to_string(), "stale".to_string())]),
			"/scratch",
		)
		.with_secrets(BTreeMap::from([(
			"ANTHROPIC_API_KEY".to_string(),
			SecretString::new("fresh"),
		)]));
		let env = builder.build(&ctx(ProviderKind::Claude, PermissionMode::Plan, None));
		assert_eq!(env.get("ANTHROPIC_API_KEY"), Some("fresh"));
		assert_eq!(env.get("CLAUDE_PERMISSION_MODE"), Some("plan"));
		assert!(env.get(PERMISSION_DIR_VAR).is_none());
	}
}
