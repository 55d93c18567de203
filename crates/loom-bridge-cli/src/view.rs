// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use loom_bridge::{ProtocolEvent, TurnResult, TurnSink, TurnState};
use loom_bridge_transcript::{SegmentKind, TranscriptEvent, TranscriptReconstructor, TranscriptSnapshot, TranscriptView};
use tracing::{debug, warn};

/// Flatten segments for a line-oriented terminal.
pub fn compose(snapshot: &TranscriptSnapshot) -> String {
	let mut out = String::new();
	for segment in &snapshot.segments {
		if !out.is_empty() && !out.ends_with('\n') {
			out.push('\n');
		}
		match segment.kind {
			SegmentKind::Thinking => {
				out.push_str("[thinking] ");
				out.push_str(&segment.text);
			}
			SegmentKind::ToolUse => {
				out.push_str("[tool] ");
				out.push_str(&segment.text);
			}
			SegmentKind::Text => out.push_str(&segment.text),
		}
	}
	out
}

/// What has already been written for the current turn.
#[derive(Debug, Default)]
struct ViewState {
	printed: String,
	line_open: bool,
}

impl ViewState {
	/// Bytes to write so the terminal shows `rendered`. A render that
	/// rewrites earlier output is reprinted below it.
	fn advance(&mut self, rendered: &str, streaming: bool) -> String {
		let mut out = String::new();
		if let Some(suffix) = rendered.strip_prefix(self.printed.as_str()) {
			out.push_str(suffix);
		} else {
			if self.line_open {
				out.push('\n');
			}
			out.push_str(rendered);
		}
		if !out.is_empty() {
			self.line_open = !out.ends_with('\n');
		}
		self.printed = rendered.to_string();
		if !streaming {
			out.push_str(&self.finish());
		}
		out
	}

	fn finish(&mut self) -> String {
		if std::mem::take(&mut self.line_open) {
			"\n".to_string()
		} else {
			String::new()
		}
	}

	fn reset(&mut self) -> String {
		let out = self.finish();
		self.printed.clear();
		out
	}
}

#[derive(Debug, Default)]
pub struct TerminalView {
	state: Mutex<ViewState>,
}

impl TerminalView {
	fn write(&self, apply: impl FnOnce(&mut ViewState) -> String) {
		let out = {
			let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
			apply(&mut state)
		};
		if out.is_empty() {
			return;
		}
		let mut stdout = std::io::stdout().lock();
		if let Err(e) = stdout.write_all(out.as_bytes()).and_then(|()| stdout.flush()) {
			debug!(error = %e, "stdout write failed");
		}
	}

	pub fn reset(&self) {
		self.write(ViewState::reset);
	}

	pub fn finish(&self) {
		self.write(ViewState::finish);
	}
}

impl TranscriptView for TerminalView {
	fn render(&self, snapshot: &TranscriptSnapshot) {
		let rendered = compose(snapshot);
		self.write(|state| state.advance(&rendered, snapshot.is_streaming));
	}
}

/// Routes turn events into the reconstructor and prints outcomes.
pub struct TerminalSink {
	view: Arc<TerminalView>,
	transcript: TranscriptReconstructor,
}

impl TerminalSink {
	pub fn new(interval: std::time::Duration) -> Self {
		let view = Arc::new(TerminalView::default());
		let transcript = TranscriptReconstructor::with_interval(view.clone(), interval);
		Self { view, transcript }
	}

	fn settle(&self) {
		self.view.render(&self.transcript.current());
		self.view.finish();
	}
}

impl TurnSink for TerminalSink {
	fn on_state(&self, channel_id: &str, state: TurnState) {
		debug!(channel_id = %channel_id, state = ?state, "turn state");
		if state == TurnState::Launched {
			self.view.reset();
			self.transcript.handle(TranscriptEvent::TurnStarted);
		}
	}

	fn on_event(&self, _channel_id: &str, event: &ProtocolEvent) {
		if let ProtocolEvent::Diagnostic(diagnostic) = event {
			if diagnostic.is_error() {
				warn!(line = %diagnostic.line, "agent error");
			}
		}
		self.transcript.handle_protocol(event);
	}

	fn on_complete(&self, _result: &TurnResult) {
		self.settle();
	}

	fn on_error(&self, result: &TurnResult) {
		self.settle();
		eprintln!("error: {}", result.error.as_deref().unwrap_or("turn failed"));
	}
}
