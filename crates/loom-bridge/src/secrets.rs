// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Credential discovery for agent processes.
//!
//! GUI-launched hosts often inherit a minimal environment that lacks the
//! API keys a user exports from their shell profile. Missing names are
//! looked up in order: the inherited environment, a login shell, and
//! finally a static read of common profile files. Values never reach logs.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Credential names forwarded to agent processes.
pub const SECRET_NAMES: &[&str] = &[
	"ANTHROPIC_API_KEY",
	"ANTHROPIC_BASE_URL",
	"ANTHROPIC_AUTH_TOKEN",
	"OPENAI_API_KEY",
	"OPENAI_BASE_URL",
	"CODEX_HOME",
];

const PROFILE_FILES: &[&str] = &[".zshrc", ".bashrc", ".bash_profile", ".profile", ".zprofile"];

const SHELL_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A string wiped from memory on drop and redacted in `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(Zeroizing<String>);

impl SecretString {
	pub fn new(value: impl Into<String>) -> Self {
		Self(Zeroizing::new(value.into()))
	}

	pub fn expose(&self) -> &str {
		self.0.as_str()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString([REDACTED])")
	}
}

/// Where a resolved secret came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
	Environment,
	LoginShell,
	ProfileFile,
}

/// Upper-case shell identifier. Only such names are ever interpolated into
/// the login-shell probe.
pub fn is_valid_name(name: &str) -> bool {
	let mut chars = name.chars();
	match chars.next() {
		Some(c) if c.is_ascii_uppercase() || c == '_' => {}
		_ => return false,
	}
	chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

#[derive(Debug, Clone)]
pub struct SecretResolver {
	names: Vec<String>,
	inherited: HashMap<String, String>,
	shell: Option<PathBuf>,
	home: Option<PathBuf>,
}

impl SecretResolver {
	/// Resolver over the current process environment, `$SHELL`, and the
	/// user's home directory.
	pub fn from_process(probe_login_shell: bool) -> Self {
		let inherited: HashMap<String, String> = std::env::vars().collect();
		let shell = if probe_login_shell {
			inherited.get("SHELL").filter(|s| !s.is_empty()).map(PathBuf::from)
		} else {
			None
		};
		Self {
			names: SECRET_NAMES.iter().map(|s| s.to_string()).collect(),
			inherited,
			shell,
			home: dirs::home_dir(),
		}
	}

	pub fn new(inherited: HashMap<String, String>) -> Self {
		Self {
			names: SECRET_NAMES.iter().map(|s| s.to_string()).collect(),
			inherited,
			shell: None,
			home: None,
		}
	}

	pub fn with_names(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
		self.names = names
			.into_iter()
			.map(Into::into)
			.filter(|n| is_valid_name(n))
			.collect();
		self
	}

	pub fn with_shell(mut self, shell: Option<PathBuf>) -> Self {
		self.shell = shell;
		self
	}

	pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
		self.home = home;
		self
	}

	/// Resolve every configured name that can be found. Names found nowhere
	/// are simply absent from the result.
	pub fn resolve(&self) -> BTreeMap<String, SecretString> {
		let mut found = BTreeMap::new();
		let mut sources = Vec::new();

		for name in &self.names {
			if let Some(value) = self.inherited.get(name).filter(|v| !v.is_empty()) {
				found.insert(name.clone(), SecretString::new(value.clone()));
				sources.push((name.clone(), SecretSource::Environment));
			}
		}

		let missing = self.missing(&found);
		if !missing.is_empty() {
			if let Some(shell) = &self.shell {
				for (name, value) in probe_login_shell(shell, &missing) {
					sources.push((name.clone(), SecretSource::LoginShell));
					found.insert(name, value);
				}
			}
		}

		let missing = self.missing(&found);
		if !missing.is_empty() {
			if let Some(home) = &self.home {
				for (name, value) in read_profile_files(home, &missing) {
					sources.push((name.clone(), SecretSource::ProfileFile));
					found.insert(name, value);
				}
			}
		}

		for (name, source) in &sources {
			debug!(name = %name, source = ?source, "resolved credential");
		}
		found
	}

	fn missing(&self, found: &BTreeMap<String, SecretString>) -> Vec<String> {
		self
			.names
			.iter()
			.filter(|n| !found.contains_key(*n))
			.cloned()
			.collect()
	}
}

/// Ask a login shell for `names`, bounded by a timeout. Failures yield an
/// empty result.
fn probe_login_shell(shell: &Path, names: &[String]) -> Vec<(String, SecretString)> {
	let names: Vec<&String> = names.iter().filter(|n| is_valid_name(n)).collect();
	if names.is_empty() {
		return Vec::new();
	}
	let script: String = names
		.iter()
		.map(|name| format!("printf '%s=%s\\0' {name} \"${{{name}-}}\";"))
		.collect();

	let mut command = Command::new(shell);
	command.arg("-l").arg("-c").arg(&script);
	match capture_stdout(command, SHELL_PROBE_TIMEOUT) {
		Some(output) => parse_probe_output(&output, &names),
		None => Vec::new(),
	}
}

/// Run `command` and collect its stdout, giving up after `timeout`.
///
/// Stdout is drained on its own thread while the child runs, so output
/// larger than the pipe buffer cannot stall the child until the deadline.
fn capture_stdout(mut command: Command, timeout: Duration) -> Option<Zeroizing<Vec<u8>>> {
	let program = command.get_program().to_string_lossy().into_owned();
	let mut child = match command
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::null())
		.spawn()
	{
		Ok(child) => child,
		Err(e) => {
			warn!(program = %program, error = %e, "login shell probe failed to start");
			return None;
		}
	};

	let mut stdout = child.stdout.take()?;
	let reader = std::thread::spawn(move || {
		let mut output = Zeroizing::new(Vec::new());
		stdout.read_to_end(&mut output).map(|_| output)
	});

	let started = Instant::now();
	loop {
		match child.try_wait() {
			Ok(Some(_)) => break,
			Ok(None) if started.elapsed() >= timeout => {
				warn!(program = %program, "login shell probe timed out");
				let _ = child.kill();
				let _ = child.wait();
				// Descendants may still hold the pipe open; the reader is left
				// to finish on its own.
				return None;
			}
			Ok(None) => std::thread::sleep(Duration::from_millis(20)),
			Err(e) => {
				warn!(program = %program, error = %e, "login shell probe wait failed");
				let _ = child.kill();
				return None;
			}
		}
	}

	match reader.join() {
		Ok(Ok(output)) => Some(output),
		Ok(Err(e)) => {
			warn!(program = %program, error = %e, "failed to read login shell probe output");
			None
		}
		Err(_) => {
			warn!(program = %program, "login shell probe reader panicked");
			None
		}
	}
}

fn parse_probe_output(output: &[u8], names: &[&String]) -> Vec<(String, SecretString)> {
	output
		.split(|b| *b == 0)
		.filter_map(|record| {
			let record = std::str::from_utf8(record).ok()?;
			let (name, value) = record.split_once('=')?;
			// Login shells may print a banner before the first record.
			let name = name.rsplit('\n').next()?.trim();
			if value.is_empty() || !names.iter().any(|n| n.as_str() == name) {
				return None;
			}
			Some((name.to_string(), SecretString::new(value)))
		})
		.collect()
}

/// Static scan of shell profiles for `export NAME=value`. Later files and
/// later lines win.
fn read_profile_files(home: &Path, names: &[String]) -> Vec<(String, SecretString)> {
	let mut found: BTreeMap<String, SecretString> = BTreeMap::new();
	for file in PROFILE_FILES {
		let path = home.join(file);
		let Ok(contents) = std::fs::read_to_string(&path) else {
			continue;
		};
		let contents = Zeroizing::new(contents);
		for (name, value) in parse_exports(&contents) {
			if names.iter().any(|n| n == &name) {
				found.insert(name, value);
			}
		}
	}
	found.into_iter().collect()
}

pub(crate) fn parse_exports(contents: &str) -> Vec<(String, SecretString)> {
	contents
		.lines()
		.filter_map(|line| {
			let line = line.trim();
			let rest = line.strip_prefix("export ")?.trim_start();
			let (name, value) = rest.split_once('=')?;
			if !is_valid_name(name) {
				return None;
			}
			let value = unquote(value.trim());
			if value.is_empty() || value.contains('$') || value.contains('`') {
				return None;
			}
			Some((name.to_string(), SecretString::new(value)))
		})
		.collect()
}

fn unquote(value: &str) -> &str {
	for quote in ['"', '\''] {
		if let Some(inner) = value.strip_prefix(quote) {
			return inner.split(quote).next().unwrap_or_default();
		}
	}
	value.split_whitespace().next().unwrap_or_default()
}
