// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Turn dispatch: one agent process, read to completion on a blocking
//! worker, with events delivered to a [`TurnSink`] in line order.
//!
//! A turn moves `Created -> Launched -> Streaming` and ends in exactly one
//! of `Completed`, `Failed` or `Interrupted`. The terminal state reaches the
//! sink once, whichever path ends the turn.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use loom_bridge_protocol::{decode_line, AgentMessage, ProtocolEvent};
use serde::Serialize;
use tracing::{debug, info, instrument, trace, warn};

use crate::aggregate::AssistantTextAggregator;
use crate::error::LaunchError;
use crate::launcher::{self, LaunchSpec, LaunchedProcess, LastDiagnostic};

pub const INTERRUPTED_MESSAGE: &str = "User interrupted";

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
	Created,
	Launched,
	Streaming,
	Completed,
	Failed,
	Interrupted,
}

impl TurnState {
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			TurnState::Completed | TurnState::Failed | TurnState::Interrupted
		)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnResult {
	pub channel_id: String,
	pub success: bool,
	/// Reconciled assistant text.
	pub text: String,
	/// Structured messages in arrival order, status chatter excluded.
	pub messages: Vec<AgentMessage>,
	pub error: Option<String>,
	pub exit_code: Option<i32>,
	pub thread_id: Option<String>,
	pub interrupted: bool,
}

impl TurnResult {
	pub fn failure(channel_id: impl Into<String>, error: impl Into<String>) -> Self {
		Self {
			channel_id: channel_id.into(),
			success: false,
			text: String::new(),
			messages: Vec::new(),
			error: Some(error.into()),
			exit_code: None,
			thread_id: None,
			interrupted: false,
		}
	}

	pub fn state(&self) -> TurnState {
		if self.interrupted {
			TurnState::Interrupted
		} else if self.success {
			TurnState::Completed
		} else {
			TurnState::Failed
		}
	}
}

/// Receives a turn's events. Called from the dispatch worker thread;
/// implementations marshal to their own context.
pub trait TurnSink: Send + Sync {
	fn on_state(&self, _channel_id: &str, _state: TurnState) {}

	fn on_event(&self, channel_id: &str, event: &ProtocolEvent);

	fn on_complete(&self, result: &TurnResult);

	fn on_error(&self, result: &TurnResult);
}

#[derive(Debug, Default)]
pub struct NullSink;

impl TurnSink for NullSink {
	fn on_event(&self, _channel_id: &str, _event: &ProtocolEvent) {}

	fn on_complete(&self, _result: &TurnResult) {}

	fn on_error(&self, _result: &TurnResult) {}
}

/// State machine for one turn, shared between the worker and the session
/// so a worker that dies still gets exactly one terminal notification.
pub struct TurnLifecycle {
	channel_id: String,
	state: Mutex<TurnState>,
	sink: Arc<dyn TurnSink>,
}

impl std::fmt::Debug for TurnLifecycle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TurnLifecycle")
			.field("channel_id", &self.channel_id)
			.field("state", &self.state())
			.finish_non_exhaustive()
	}
}

impl TurnLifecycle {
	pub fn new(channel_id: impl Into<String>, sink: Arc<dyn TurnSink>) -> Self {
		Self {
			channel_id: channel_id.into(),
			state: Mutex::new(TurnState::Created),
			sink,
		}
	}

	pub fn state(&self) -> TurnState {
		*lock(&self.state)
	}

	pub fn channel_id(&self) -> &str {
		&self.channel_id
	}

	/// Move to a non-terminal state. Ignored once terminal.
	pub fn advance(&self, next: TurnState) {
		debug_assert!(!next.is_terminal());
		{
			let mut state = lock(&self.state);
			if state.is_terminal() || *state == next {
				return;
			}
			*state = next;
		}
		self.sink.on_state(&self.channel_id, next);
	}

	/// Deliver the terminal state. Returns `false` if one was already sent.
	pub fn terminate(&self, result: &TurnResult) -> bool {
		let next = result.state();
		{
			let mut state = lock(&self.state);
			if state.is_terminal() {
				return false;
			}
			*state = next;
		}
		self.sink.on_state(&self.channel_id, next);
		if result.success {
			self.sink.on_complete(result);
		} else {
			self.sink.on_error(result);
		}
		true
	}

	fn event(&self, event: &ProtocolEvent) {
		self.sink.on_event(&self.channel_id, event);
	}
}

/// A reserved or running turn. The process handle is present only between
/// a successful spawn and cleanup.
#[derive(Debug)]
pub struct ActiveTurn {
	channel_id: String,
	generation: u64,
	interrupted: AtomicBool,
	child: Mutex<Option<Child>>,
}

impl ActiveTurn {
	pub fn channel_id(&self) -> &str {
		&self.channel_id
	}

	pub fn is_interrupted(&self) -> bool {
		self.interrupted.load(Ordering::SeqCst)
	}

	pub fn has_process(&self) -> bool {
		lock(&self.child).is_some()
	}

	/// Flag the turn and kill its process if one is running. A turn still
	/// launching is killed as soon as its process is attached.
	pub fn interrupt(&self) {
		self.interrupted.store(true, Ordering::SeqCst);
		let mut child = lock(&self.child);
		if let Some(child) = child.as_mut() {
			if matches!(child.try_wait(), Ok(None)) {
				info!(channel_id = %self.channel_id, pid = child.id(), "interrupting agent process");
				launcher::terminate(child);
			}
		}
	}

	fn attach(&self, mut child: Child) {
		let mut slot = lock(&self.child);
		if self.is_interrupted() {
			launcher::terminate(&mut child);
		}
		*slot = Some(child);
	}

	/// Poll until the attached process exits. Polling keeps the handle
	/// available to [`ActiveTurn::interrupt`] while waiting.
	fn wait(&self) -> std::io::Result<Option<i32>> {
		loop {
			{
				let mut slot = lock(&self.child);
				let Some(child) = slot.as_mut() else {
					return Ok(None);
				};
				if let Some(status) = child.try_wait()? {
					return Ok(status.code());
				}
			}
			std::thread::sleep(EXIT_POLL_INTERVAL);
		}
	}

	/// Kill if still running, reap, and drop the handle.
	fn release_process(&self) {
		let taken = lock(&self.child).take();
		if let Some(mut child) = taken {
			if matches!(child.try_wait(), Ok(None)) {
				launcher::terminate(&mut child);
			}
			let _ = child.wait();
		}
	}
}

/// Single-flight slot for one session's turns plus the generation used to
/// silence processes that outlive a restart.
#[derive(Debug, Default)]
pub struct ProcessSlot {
	active: Mutex<Option<Arc<ActiveTurn>>>,
	generation: AtomicU64,
}

impl ProcessSlot {
	pub fn new() -> Self {
		Self::default()
	}

	/// Claim the slot, or `None` if a turn is already in flight.
	pub fn reserve(&self, channel_id: impl Into<String>) -> Option<Arc<ActiveTurn>> {
		let mut active = lock(&self.active);
		if active.is_some() {
			return None;
		}
		let turn = Arc::new(ActiveTurn {
			channel_id: channel_id.into(),
			generation: self.generation.load(Ordering::SeqCst),
			interrupted: AtomicBool::new(false),
			child: Mutex::new(None),
		});
		*active = Some(Arc::clone(&turn));
		Some(turn)
	}

	pub fn active(&self) -> Option<Arc<ActiveTurn>> {
		lock(&self.active).clone()
	}

	pub fn release(&self, turn: &Arc<ActiveTurn>) {
		let mut active = lock(&self.active);
		if active.as_ref().is_some_and(|a| Arc::ptr_eq(a, turn)) {
			*active = None;
		}
	}

	/// Whether output from `turn` should still be dispatched.
	pub fn is_current(&self, turn: &ActiveTurn) -> bool {
		self.generation.load(Ordering::SeqCst) == turn.generation
	}

	/// Invalidate every turn reserved so far.
	pub fn bump_generation(&self) -> u64 {
		self.generation.fetch_add(1, Ordering::SeqCst) + 1
	}
}

/// Inputs that decide how a finished process is reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitSummary {
	pub interrupted: bool,
	pub send_error: Option<String>,
	pub exit_code: Option<i32>,
	pub last_diagnostic: Option<String>,
}

impl ExitSummary {
	/// `None` for success, otherwise the turn's error message. Interruption
	/// wins over everything, then an explicit agent error, then the exit
	/// status.
	pub fn failure_reason(&self) -> Option<String> {
		if self.interrupted {
			return Some(INTERRUPTED_MESSAGE.to_string());
		}
		if let Some(error) = &self.send_error {
			return Some(error.clone());
		}
		let base = match self.exit_code {
			Some(0) => return None,
			Some(code) => format!("Process exited with code {code}"),
			None => "Process terminated by signal".to_string(),
		};
		Some(match &self.last_diagnostic {
			Some(diagnostic) => format!("{base}: {diagnostic}"),
			None => base,
		})
	}
}

struct TurnCleanup {
	slot: Arc<ProcessSlot>,
	turn: Arc<ActiveTurn>,
	temp_dir: PathBuf,
}

impl Drop for TurnCleanup {
	fn drop(&mut self) {
		self.turn.release_process();
		self.slot.release(&self.turn);
		match std::fs::remove_dir_all(&self.temp_dir) {
			Ok(()) => {}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => warn!(path = %self.temp_dir.display(), error = %e, "failed to remove turn temp dir"),
		}
		debug!(channel_id = %self.turn.channel_id, "turn cleaned up");
	}
}

pub(crate) struct TurnJob {
	pub spec: LaunchSpec,
	pub turn: Arc<ActiveTurn>,
	pub slot: Arc<ProcessSlot>,
	pub lifecycle: Arc<TurnLifecycle>,
}

#[derive(Default)]
struct StreamState {
	aggregator: AssistantTextAggregator,
	messages: Vec<AgentMessage>,
	thread_id: Option<String>,
	send_error: Option<String>,
	last_error_line: Option<String>,
}

impl StreamState {
	fn observe(&mut self, event: &ProtocolEvent) {
		match event {
			ProtocolEvent::ThreadId(id) if !id.is_empty() => self.thread_id = Some(id.clone()),
			ProtocolEvent::SendError(message) => {
				if self.send_error.is_none() {
					self.send_error = Some(message.clone());
				}
			}
			ProtocolEvent::Diagnostic(diagnostic) if diagnostic.is_error() => {
				self.last_error_line = Some(diagnostic.line.clone());
			}
			ProtocolEvent::Message(message) if !message.is_status() => {
				self.messages.push(message.clone());
			}
			_ => {}
		}
		self.aggregator.observe(event);
	}
}

/// Run one turn to completion. Blocking; call from a blocking worker.
///
/// A launch failure is reported to the sink and returned; no process is
/// registered in that case.
#[instrument(skip_all, fields(channel_id = %job.turn.channel_id))]
pub(crate) fn run_turn(job: TurnJob) -> Result<TurnResult, LaunchError> {
	let TurnJob {
		spec,
		turn,
		slot,
		lifecycle,
	} = job;
	let _cleanup = TurnCleanup {
		slot: Arc::clone(&slot),
		turn: Arc::clone(&turn),
		temp_dir: spec.env.temp_dir.clone(),
	};

	let LaunchedProcess {
		child,
		stdout,
		stderr,
		program,
	} = match launcher::launch(&spec) {
		Ok(launched) => launched,
		Err(e) => {
			warn!(error = %e, "agent launch failed");
			lifecycle.terminate(&TurnResult::failure(turn.channel_id(), e.to_string()));
			return Err(e);
		}
	};

	let stderr_line: LastDiagnostic = Arc::new(Mutex::new(None));
	let drain = stderr.and_then(|stderr| launcher::drain_stderr(stderr, Arc::clone(&stderr_line)));
	turn.attach(child);
	lifecycle.advance(TurnState::Launched);

	let mut state = StreamState::default();
	let mut reader = BufReader::new(stdout);
	let mut buf = Vec::new();
	let mut streaming = false;
	let mut dropped = 0usize;
	loop {
		buf.clear();
		match reader.read_until(b'\n', &mut buf) {
			Ok(0) => break,
			Ok(_) => {}
			Err(e) => {
				warn!(error = %e, "agent stdout read failed");
				break;
			}
		}
		let raw = String::from_utf8_lossy(&buf);
		let line = raw.strip_suffix('\n').unwrap_or(&raw);
		if line.trim().is_empty() {
			continue;
		}
		if !slot.is_current(&turn) {
			dropped += 1;
			continue;
		}

		let event = decode_line(line);
		trace!(event = event.name(), "agent event");
		if let ProtocolEvent::Diagnostic(diagnostic) = &event {
			debug!(target: "loom_bridge::agent_stdout", line = %diagnostic.line);
		}
		if !streaming {
			streaming = true;
			lifecycle.advance(TurnState::Streaming);
		}
		state.observe(&event);
		lifecycle.event(&event);
	}

	let exit_code = match turn.wait() {
		Ok(code) => code,
		Err(e) => {
			warn!(error = %e, "waiting for agent process failed");
			None
		}
	};
	if let Some(handle) = drain {
		if handle.join().is_err() {
			warn!("stderr drain panicked");
		}
	}
	if dropped > 0 {
		debug!(dropped, "discarded output from a superseded process");
	}

	let summary = ExitSummary {
		interrupted: turn.is_interrupted(),
		send_error: state.send_error.take(),
		exit_code,
		last_diagnostic: state
			.last_error_line
			.take()
			.or_else(|| lock(&stderr_line).take()),
	};
	let error = summary.failure_reason();
	let result = TurnResult {
		channel_id: turn.channel_id().to_string(),
		success: error.is_none(),
		text: state.aggregator.into_text(),
		messages: state.messages,
		error,
		exit_code,
		thread_id: state.thread_id,
		interrupted: summary.interrupted,
	};
	info!(
		program = %program.display(),
		exit_code = ?exit_code,
		success = result.success,
		interrupted = result.interrupted,
		"agent turn finished"
	);
	lifecycle.terminate(&result);
	Ok(result)
}
