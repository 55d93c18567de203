// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Spawning one agent process per turn.

use std::ffi::OsString;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use loom_bridge_protocol::TurnInput;
use loom_bridge_runtime::ENTRY_SCRIPT;
use tracing::{debug, info, warn};

use crate::environment::TurnEnvironment;
use crate::error::LaunchError;
use crate::provider::ProviderKind;

/// Program and arguments for an agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
	pub program: String,
	pub args: Vec<OsString>,
}

impl AgentCommand {
	/// `node <runtime>/bridge/index.js <provider>`.
	pub fn bridge(node: impl Into<String>, runtime_dir: &Path, provider: ProviderKind) -> Self {
		Self {
			program: node.into(),
			args: vec![
				runtime_dir.join(ENTRY_SCRIPT).into_os_string(),
				OsString::from(provider.as_str()),
			],
		}
	}

	/// A configured override: first element is the program.
	pub fn from_argv(argv: &[String]) -> Result<Self, LaunchError> {
		let (program, args) = argv.split_first().ok_or(LaunchError::EmptyCommand)?;
		Ok(Self {
			program: program.clone(),
			args: args.iter().map(OsString::from).collect(),
		})
	}
}

/// The requested directory if it exists, otherwise the runtime directory.
pub fn resolve_working_dir(requested: Option<&Path>, runtime_dir: &Path) -> PathBuf {
	match requested {
		Some(dir) if dir.is_dir() => dir.to_path_buf(),
		Some(dir) => {
			warn!(
				requested = %dir.display(),
				fallback = %runtime_dir.display(),
				"working directory does not exist, using runtime directory"
			);
			runtime_dir.to_path_buf()
		}
		None => runtime_dir.to_path_buf(),
	}
}

/// Resolve `program` against `search_path`. Paths are checked directly.
pub fn locate_executable(program: &str, search_path: &str, cwd: &Path) -> Result<PathBuf, LaunchError> {
	which::which_in(program, Some(search_path), cwd).map_err(|e| {
		debug!(program = %program, error = %e, "executable lookup failed");
		LaunchError::ExecutableNotFound {
			name: program.to_string(),
		}
	})
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
	pub command: AgentCommand,
	pub working_dir: PathBuf,
	pub env: TurnEnvironment,
	pub input: TurnInput,
}

#[derive(Debug)]
pub struct LaunchedProcess {
	pub child: Child,
	pub stdout: ChildStdout,
	pub stderr: Option<ChildStderr>,
	pub program: PathBuf,
}

/// Spawn the agent, hand it its turn input on stdin, and close stdin.
///
/// On error no process is left running.
pub fn launch(spec: &LaunchSpec) -> Result<LaunchedProcess, LaunchError> {
	let search_path = spec.env.get("PATH").unwrap_or_default();
	let program = locate_executable(&spec.command.program, search_path, &spec.working_dir)?;
	let payload = spec.input.to_json()?;

	std::fs::create_dir_all(&spec.env.temp_dir).map_err(|source| LaunchError::TempDir {
		path: spec.env.temp_dir.clone(),
		source,
	})?;

	let mut command = Command::new(&program);
	command
		.args(&spec.command.args)
		.current_dir(&spec.working_dir)
		.env_clear()
		.envs(&spec.env.vars)
		.stdin(Stdio::piped())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped());
	// Own process group so an interrupt reaches the agent's children too.
	#[cfg(unix)]
	{
		use std::os::unix::process::CommandExt;
		command.process_group(0);
	}
	let mut child = command
		.spawn()
		.map_err(|source| LaunchError::Spawn {
			program: program.clone(),
			source,
		})?;

	info!(
		pid = child.id(),
		program = %program.display(),
		cwd = %spec.working_dir.display(),
		channel_id = %spec.input.channel_id,
		"spawned agent process"
	);

	if let Err(e) = write_input(&mut child, &payload) {
		// A process that exits without reading its input reports through its
		// output and exit status instead.
		if e.kind() == ErrorKind::BrokenPipe {
			warn!(pid = child.id(), "agent closed stdin before reading turn input");
		} else {
			abandon(&mut child);
			return Err(LaunchError::Stdin(e));
		}
	}

	let Some(stdout) = child.stdout.take() else {
		abandon(&mut child);
		return Err(LaunchError::Spawn {
			program,
			source: std::io::Error::other("stdout was not captured"),
		});
	};
	let stderr = child.stderr.take();

	Ok(LaunchedProcess {
		child,
		stdout,
		stderr,
		program,
	})
}

fn write_input(child: &mut Child, payload: &str) -> std::io::Result<()> {
	let mut stdin = child
		.stdin
		.take()
		.ok_or_else(|| std::io::Error::other("stdin was not captured"))?;
	stdin.write_all(payload.as_bytes())?;
	stdin.write_all(b"\n")?;
	stdin.flush()
}

fn abandon(child: &mut Child) {
	terminate(child);
	let _ = child.wait();
}

/// Kill the agent and its process group. Does not reap.
pub fn terminate(child: &mut Child) {
	#[cfg(unix)]
	{
		if let Ok(pid) = i32::try_from(child.id()) {
			// SAFETY: signalling a process group we created; no memory is shared.
			unsafe {
				libc::kill(-pid, libc::SIGKILL);
			}
		}
	}
	if let Err(e) = child.kill() {
		debug!(pid = child.id(), error = %e, "kill failed");
	}
}

/// Most recent diagnostic line, shared with the dispatcher.
pub type LastDiagnostic = Arc<Mutex<Option<String>>>;

/// Drain stderr on a helper thread. Every line goes to debug logs and
/// replaces `last`.
pub fn drain_stderr(stderr: ChildStderr, last: LastDiagnostic) -> Option<JoinHandle<()>> {
	let spawned = std::thread::Builder::new()
		.name("agent-stderr".to_string())
		.spawn(move || {
			let mut reader = BufReader::new(stderr);
			let mut buf = Vec::new();
			loop {
				buf.clear();
				match reader.read_until(b'\n', &mut buf) {
					Ok(0) => break,
					Ok(_) => {
						let line = String::from_utf8_lossy(&buf);
						let line = line.trim_end_matches(['\n', '\r']);
						if line.is_empty() {
							continue;
						}
						debug!(target: "loom_bridge::agent_stderr", line = %line);
						*last.lock().unwrap_or_else(PoisonError::into_inner) = Some(line.to_string());
					}
					Err(e) => {
						debug!(error = %e, "stderr read failed");
						break;
					}
				}
			}
		});
	match spawned {
		Ok(handle) => Some(handle),
		Err(e) => {
			warn!(error = %e, "could not start stderr drain");
			None
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_bridge_command_shape() {
		let cmd = AgentCommand::bridge("node", Path::new("/rt"), ProviderKind::Codex);
		assert_eq!(cmd.program, "node");
		assert_eq!(
			cmd.args,
			vec![OsString::from("/rt/bridge/index.js"), OsString::from("codex")]
		);
	}

	#[test]
	fn test_empty_override_is_rejected() {
		assert!(matches!(AgentCommand::from_argv(&[]), Err(LaunchError::EmptyCommand)));
		let cmd = AgentCommand::from_argv(&["/bin/sh".to_string(), "-c".to_string()]).unwrap();
		assert_eq!(cmd.program, "/bin/sh");
		assert_eq!(cmd.args, vec![OsString::from("-c")]);
	}

	#[test]
	fn test_working_dir_fallback() {
		let dir = tempfile::tempdir().unwrap();
		let runtime = dir.path().join("runtime");
		assert_eq!(resolve_working_dir(Some(dir.path()), &runtime), dir.path());
		assert_eq!(
			resolve_working_dir(Some(&dir.path().join("gone")), &runtime),
			runtime
		);
		assert_eq!(resolve_working_dir(None, &runtime), runtime);
	}

	#[test]
	fn test_missing_executable() {
		let dir = tempfile::tempdir().unwrap();
		let err = locate_executable("loom-no-such-binary", "", dir.path()).unwrap_err();
		assert!(matches!(err, LaunchError::ExecutableNotFound { ref name } if name == "loom-no-such-binary"));
	}

	#[cfg(unix)]
	#[test]
	fn test_locates_absolute_path() {
		let dir = tempfile::tempdir().unwrap();
		assert_eq!(
			locate_executable("/bin/sh", "", dir.path()).unwrap(),
			PathBuf::from("/bin/sh")
		);
	}
}
