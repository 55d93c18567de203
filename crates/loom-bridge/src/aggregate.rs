// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Final assistant text for a turn.
//!
//! Agents report text as deltas, as aggregated snapshots of the current
//! message, and as structured messages, often all three for the same
//! message. Reconciliation is positional: a snapshot is compared against
//! the text accumulated for the current message only. A snapshot the
//! accumulated text already starts with adds nothing. A snapshot that
//! extends it contributes only the missing suffix. Anything else is a new
//! message and is appended as its own paragraph. Repeated phrases inside
//! genuinely new output are therefore never swallowed.

use loom_bridge_protocol::ProtocolEvent;

const PARAGRAPH: &str = "\n\n";

#[derive(Debug, Clone, Default)]
pub struct AssistantTextAggregator {
	buffer: String,
	/// Byte offset where the open message's text begins.
	current_start: usize,
	open: bool,
	/// The open message was built from deltas or `Content` snapshots.
	streamed: bool,
	/// Text of the last streamed message, until the next message starts. A
	/// structured message repeating it exactly is the same message.
	last_streamed: Option<String>,
}

enum Reconcile {
	Covered,
	Extend(usize),
	Unrelated,
}

impl AssistantTextAggregator {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn text(&self) -> &str {
		&self.buffer
	}

	pub fn into_text(self) -> String {
		self.buffer
	}

	pub fn is_empty(&self) -> bool {
		self.buffer.is_empty()
	}

	pub fn observe(&mut self, event: &ProtocolEvent) {
		match event {
			ProtocolEvent::MessageStart => {
				self.close();
				self.last_streamed = None;
			}
			ProtocolEvent::MessageEnd => self.close(),
			ProtocolEvent::ContentDelta(text) => self.push_delta(text),
			ProtocolEvent::Content(text) => self.push_snapshot(text, false),
			ProtocolEvent::Message(message) if message.is_assistant() => {
				self.push_snapshot(&message.text(), true);
			}
			_ => {}
		}
	}

	fn current(&self) -> &str {
		if self.open {
			&self.buffer[self.current_start..]
		} else {
			""
		}
	}

	fn open(&mut self, streamed: bool) {
		if self.open {
			return;
		}
		if !self.buffer.is_empty() {
			self.buffer.push_str(PARAGRAPH);
		}
		self.current_start = self.buffer.len();
		self.open = true;
		self.streamed = streamed;
	}

	fn close(&mut self) {
		if !self.open {
			return;
		}
		self.last_streamed = self.streamed.then(|| self.current().to_string());
		self.open = false;
	}

	pub fn push_delta(&mut self, text: &str) {
		if text.is_empty() {
			return;
		}
		self.open(true);
		self.buffer.push_str(text);
	}

	/// Reconcile a full-text snapshot. `complete` marks a structured message,
	/// which also closes the message it describes.
	pub fn push_snapshot(&mut self, snapshot: &str, complete: bool) {
		if snapshot.is_empty() {
			return;
		}

		if !self.open {
			if complete && self.last_streamed.as_deref() == Some(snapshot) {
				self.last_streamed = None;
				return;
			}
			self.open(!complete);
			self.buffer.push_str(snapshot);
			if complete {
				self.close();
			}
			return;
		}

		let current = self.current();
		let verdict = if current.starts_with(snapshot) {
			Reconcile::Covered
		} else if snapshot.starts_with(current) {
			Reconcile::Extend(current.len())
		} else {
			Reconcile::Unrelated
		};

		match verdict {
			Reconcile::Covered => {}
			Reconcile::Extend(from) => self.buffer.push_str(&snapshot[from..]),
			Reconcile::Unrelated => {
				self.close();
				self.open(!complete);
				self.buffer.push_str(snapshot);
			}
		}
		if complete {
			self.close();
		}
	}
}
