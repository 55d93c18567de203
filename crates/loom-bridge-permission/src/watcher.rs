// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! File transport between an agent process and the correlator.
//!
//! The agent writes `request-<id>.json` into the session's permission
//! directory and polls for `response-<id>.json`. The watcher turns each
//! request file into a correlator prompt and writes the outcome back.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::correlator::PermissionCorrelator;
use crate::error::{PermissionError, PermissionResult};
use crate::prompt::{PermissionOutcome, PermissionPrompt, PromptKind};

const REQUEST_PREFIX: &str = "request-";
const RESPONSE_PREFIX: &str = "response-";
const FILE_SUFFIX: &str = ".json";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Owns the per-session permission directory.
///
/// The directory is created by [`PermissionDirectory::init`] and removed by
/// [`PermissionDirectory::clear`]; [`PermissionDirectory::path`] returns
/// `None` outside that window.
#[derive(Debug)]
pub struct PermissionDirectory {
	root: PathBuf,
	current: Mutex<Option<PathBuf>>,
}

impl PermissionDirectory {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self {
			root: root.into(),
			current: Mutex::new(None),
		}
	}

	/// Create (or reuse) the directory for `session_id`.
	pub fn init(&self, session_id: &str) -> PermissionResult<PathBuf> {
		let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
		if let Some(dir) = current.as_ref() {
			if dir.ends_with(session_id) && dir.is_dir() {
				return Ok(dir.clone());
			}
		}
		let dir = self.root.join(session_id);
		std::fs::create_dir_all(&dir)?;
		debug!(path = %dir.display(), "initialised permission directory");
		*current = Some(dir.clone());
		Ok(dir)
	}

	pub fn path(&self) -> Option<PathBuf> {
		self.current
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}

	/// Remove the directory and forget it.
	pub fn clear(&self) -> PermissionResult<()> {
		let taken = self
			.current
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();
		if let Some(dir) = taken {
			match std::fs::remove_dir_all(&dir) {
				Ok(()) => debug!(path = %dir.display(), "cleared permission directory"),
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
				Err(e) => return Err(e.into()),
			}
		}
		Ok(())
	}
}

/// What an agent writes into a request file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
	#[serde(default = "default_kind")]
	pub kind: PromptKind,
	#[serde(default)]
	pub tool_name: Option<String>,
	#[serde(default)]
	pub input: Value,
	#[serde(default)]
	pub message: Option<String>,
}

fn default_kind() -> PromptKind {
	PromptKind::ToolUse
}

impl FileRequest {
	fn into_prompt(self) -> PermissionPrompt {
		PermissionPrompt {
			kind: self.kind,
			tool_name: self.tool_name,
			input: self.input,
			message: self.message,
			requested_at: Utc::now(),
		}
	}
}

/// What the watcher writes back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResponse {
	pub behavior: String,
	#[serde(default)]
	pub remember: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub answers: Option<Value>,
}

impl From<&PermissionOutcome> for FileResponse {
	fn from(outcome: &PermissionOutcome) -> Self {
		Self {
			behavior: outcome.behavior().to_string(),
			remember: matches!(outcome, PermissionOutcome::AllowAlways),
			message: outcome.message().map(str::to_string),
			answers: match outcome {
				PermissionOutcome::Answered { answers } => Some(answers.clone()),
				_ => None,
			},
		}
	}
}

fn request_id(path: &Path) -> Option<String> {
	let name = path.file_name()?.to_str()?;
	let id = name.strip_prefix(REQUEST_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
	(!id.is_empty()).then(|| id.to_string())
}

/// Polls a permission directory until dropped.
#[derive(Debug)]
pub struct PermissionWatcher {
	task: JoinHandle<()>,
}

impl PermissionWatcher {
	/// Prompts raised from `dir` are registered under `scope` in the
	/// correlator.
	pub fn spawn(dir: PathBuf, scope: impl Into<String>, correlator: PermissionCorrelator) -> Self {
		Self::spawn_with_interval(dir, scope, correlator, DEFAULT_POLL_INTERVAL)
	}

	pub fn spawn_with_interval(
		dir: PathBuf,
		scope: impl Into<String>,
		correlator: PermissionCorrelator,
		poll_interval: Duration,
	) -> Self {
		let scope: Arc<str> = scope.into().into();
		info!(path = %dir.display(), scope = %scope, "watching permission directory");
		let in_flight = Arc::new(Mutex::new(HashSet::new()));
		let task = tokio::spawn(async move {
			let mut interval = tokio::time::interval(poll_interval);
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				interval.tick().await;
				if let Err(e) = scan(&dir, &scope, &correlator, &in_flight).await {
					debug!(path = %dir.display(), error = %e, "permission directory scan failed");
				}
			}
		});
		Self { task }
	}
}

impl Drop for PermissionWatcher {
	fn drop(&mut self) {
		self.task.abort();
	}
}

async fn scan(
	dir: &Path,
	scope: &Arc<str>,
	correlator: &PermissionCorrelator,
	in_flight: &Arc<Mutex<HashSet<String>>>,
) -> PermissionResult<()> {
	let mut entries = tokio::fs::read_dir(dir).await?;
	while let Some(entry) = entries.next_entry().await? {
		let path = entry.path();
		let Some(id) = request_id(&path) else {
			continue;
		};
		if !in_flight
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(id.clone())
		{
			continue;
		}

		let request = match read_request(&path).await {
			Ok(request) => request,
			Err(PermissionError::MalformedRequest { source, .. }) if source.is_eof() => {
				// Still being written; pick it up again on the next poll.
				debug!(request_id = %id, "permission request incomplete; retrying");
				in_flight
					.lock()
					.unwrap_or_else(PoisonError::into_inner)
					.remove(&id);
				continue;
			}
			Err(e) => {
				warn!(error = %e, "discarding unreadable permission request");
				let _ = tokio::fs::remove_file(&path).await;
				in_flight
					.lock()
					.unwrap_or_else(PoisonError::into_inner)
					.remove(&id);
				continue;
			}
		};

		debug!(request_id = %id, kind = ?request.kind, "picked up permission request");
		let correlator = correlator.clone();
		let scope = Arc::clone(scope);
		let in_flight = Arc::clone(in_flight);
		let dir = dir.to_path_buf();
		tokio::spawn(async move {
			let outcome = correlator
				.request_approval_in(&scope, request.into_prompt())
				.outcome()
				.await;
			if let Err(e) = write_response(&dir, &id, &outcome).await {
				warn!(request_id = %id, error = %e, "failed to write permission response");
			}
			let _ = tokio::fs::remove_file(&path).await;
			in_flight
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.remove(&id);
		});
	}
	Ok(())
}

async fn read_request(path: &Path) -> PermissionResult<FileRequest> {
	let raw = tokio::fs::read(path).await?;
	serde_json::from_slice(&raw).map_err(|source| PermissionError::MalformedRequest {
		path: path.to_path_buf(),
		source,
	})
}

/// Write `response-<id>.json` via a temp file and rename.
pub async fn write_response(
	dir: &Path,
	id: &str,
	outcome: &PermissionOutcome,
) -> PermissionResult<PathBuf> {
	let body = serde_json::to_vec(&FileResponse::from(outcome)).map_err(PermissionError::Encode)?;
	let target = dir.join(format!("{RESPONSE_PREFIX}{id}{FILE_SUFFIX}"));
	let staging = dir.join(format!(".{RESPONSE_PREFIX}{id}{FILE_SUFFIX}.tmp"));
	tokio::fs::write(&staging, body).await?;
	tokio::fs::rename(&staging, &target).await?;
	Ok(target)
}
