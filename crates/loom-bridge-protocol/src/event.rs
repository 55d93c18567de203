// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use crate::message::AgentMessage;

/// A typed event decoded from one line of agent output.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
	MessageStart,
	MessageEnd,
	/// Provider-assigned conversation id used to resume on the next turn.
	ThreadId(String),
	/// Structured message destined for the permanent message list.
	Message(AgentMessage),
	/// Transient progress chatter; never added to the message list.
	Status(String),
	ContentDelta(String),
	ThinkingDelta(String),
	/// Aggregated assistant text snapshot.
	Content(String),
	/// Aggregated reasoning snapshot.
	Thinking(String),
	/// Explicit agent error; the turn fails with this message.
	SendError(String),
	Diagnostic(Diagnostic),
}

impl ProtocolEvent {
	/// Short name used in log fields.
	pub fn name(&self) -> &'static str {
		match self {
			ProtocolEvent::MessageStart => "message_start",
			ProtocolEvent::MessageEnd => "message_end",
			ProtocolEvent::ThreadId(_) => "thread_id",
			ProtocolEvent::Message(_) => "message",
			ProtocolEvent::Status(_) => "status",
			ProtocolEvent::ContentDelta(_) => "content_delta",
			ProtocolEvent::ThinkingDelta(_) => "thinking_delta",
			ProtocolEvent::Content(_) => "content",
			ProtocolEvent::Thinking(_) => "thinking",
			ProtocolEvent::SendError(_) => "send_error",
			ProtocolEvent::Diagnostic(_) => "diagnostic",
		}
	}
}

/// An untagged output line, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
	pub line: String,
	pub kind: DiagnosticKind,
}

impl Diagnostic {
	pub fn new(line: impl Into<String>) -> Self {
		let line = line.into();
		let kind = DiagnosticKind::classify(&line);
		Self { line, kind }
	}

	/// Whether this line should be carried into a failed turn's error message.
	pub fn is_error(&self) -> bool {
		self.kind.is_error()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
	Plain,
	Debug,
	UncaughtError,
	UnhandledRejection,
	CommandError,
}

impl DiagnosticKind {
	const MARKERS: [(&'static str, DiagnosticKind); 4] = [
		("[UNCAUGHT_ERROR]", DiagnosticKind::UncaughtError),
		("[UNHANDLED_REJECTION]", DiagnosticKind::UnhandledRejection),
		("[COMMAND_ERROR]", DiagnosticKind::CommandError),
		("[DEBUG]", DiagnosticKind::Debug),
	];

	/// Classify a line by the first marker it contains anywhere.
	///
	/// Error markers win over `[DEBUG]` when a line carries both.
	pub fn classify(line: &str) -> Self {
		Self::MARKERS
			.iter()
			.find(|(marker, _)| line.contains(*marker))
			.map(|(_, kind)| *kind)
			.unwrap_or(DiagnosticKind::Plain)
	}

	pub fn is_error(&self) -> bool {
		matches!(
			self,
			DiagnosticKind::UncaughtError
				| DiagnosticKind::UnhandledRejection
				| DiagnosticKind::CommandError
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_classify_markers() {
		assert_eq!(DiagnosticKind::classify("plain output"), DiagnosticKind::Plain);
		assert_eq!(
			DiagnosticKind::classify("[DEBUG] loading config"),
			DiagnosticKind::Debug
		);
		assert_eq!(
			DiagnosticKind::classify("node: [UNCAUGHT_ERROR] boom"),
			DiagnosticKind::UncaughtError
		);
		assert_eq!(
			DiagnosticKind::classify("[UNHANDLED_REJECTION] promise"),
			DiagnosticKind::UnhandledRejection
		);
		assert_eq!(
			DiagnosticKind::classify("[COMMAND_ERROR] exit 2"),
			DiagnosticKind::CommandError
		);
	}

	/// **Test: Error markers beat the debug marker**
	///
	/// Bridges prefix everything they print with `[DEBUG]`, including the
	/// error handlers. Those lines still need to reach the final error text.
	#[test]
	fn test_error_marker_wins_over_debug() {
		let diag = Diagnostic::new("[DEBUG] [UNCAUGHT_ERROR] TypeError: x is undefined");
		assert_eq!(diag.kind, DiagnosticKind::UncaughtError);
		assert!(diag.is_error());
		assert!(!Diagnostic::new("[DEBUG] fine").is_error());
	}
}
