// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Line decoding.
//!
//! A line is classified by matching the known tag prefixes in a fixed
//! priority order. Anything that matches no tag is a diagnostic. Payload
//! problems never fail the decode: they are logged and the raw line is
//! returned as a diagnostic instead.

use serde_json::Value;
use tracing::warn;

use crate::error::{ProtocolError, ProtocolResult};
use crate::event::{Diagnostic, ProtocolEvent};
use crate::message::AgentMessage;

/// Known line tags, in matching priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
	MessageStart,
	MessageEnd,
	ThreadId,
	SessionId,
	ContentDelta,
	ThinkingDelta,
	Content,
	Thinking,
	SendError,
	Message,
}

impl Tag {
	pub const PRIORITY: [Tag; 10] = [
		Tag::MessageStart,
		Tag::MessageEnd,
		Tag::ThreadId,
		Tag::SessionId,
		Tag::ContentDelta,
		Tag::ThinkingDelta,
		Tag::Content,
		Tag::Thinking,
		Tag::SendError,
		Tag::Message,
	];

	pub fn marker(&self) -> &'static str {
		match self {
			Tag::MessageStart => "[MESSAGE_START]",
			Tag::MessageEnd => "[MESSAGE_END]",
			Tag::ThreadId => "[THREAD_ID]",
			Tag::SessionId => "[SESSION_ID]",
			Tag::ContentDelta => "[CONTENT_DELTA]",
			Tag::ThinkingDelta => "[THINKING_DELTA]",
			Tag::Content => "[CONTENT]",
			Tag::Thinking => "[THINKING]",
			Tag::SendError => "[SEND_ERROR]",
			Tag::Message => "[MESSAGE]",
		}
	}

	/// Find the tag a line starts with, returning it with the payload.
	pub fn split(line: &str) -> Option<(Tag, &str)> {
		Self::PRIORITY
			.iter()
			.find_map(|tag| line.strip_prefix(tag.marker()).map(|rest| (*tag, rest)))
	}
}

/// Decode one output line. Never fails.
pub fn decode_line(line: &str) -> ProtocolEvent {
	let line = line.strip_suffix('\r').unwrap_or(line);
	let Some((tag, payload)) = Tag::split(line) else {
		return ProtocolEvent::Diagnostic(Diagnostic::new(line));
	};

	match decode_payload(tag, payload) {
		Ok(event) => event,
		Err(e) => {
			warn!(tag = tag.marker(), error = %e, "skipping malformed protocol line");
			ProtocolEvent::Diagnostic(Diagnostic::new(line))
		}
	}
}

fn decode_payload(tag: Tag, payload: &str) -> ProtocolResult<ProtocolEvent> {
	let event = match tag {
		Tag::MessageStart => ProtocolEvent::MessageStart,
		Tag::MessageEnd => ProtocolEvent::MessageEnd,
		Tag::ThreadId | Tag::SessionId => {
			let id = payload.trim();
			if id.is_empty() {
				return Err(ProtocolError::EmptyPayload(tag.marker()));
			}
			ProtocolEvent::ThreadId(id.to_string())
		}
		Tag::ContentDelta => ProtocolEvent::ContentDelta(unescape_text(payload)),
		Tag::ThinkingDelta => ProtocolEvent::ThinkingDelta(unescape_text(payload)),
		Tag::Content => ProtocolEvent::Content(unescape_text(payload)),
		Tag::Thinking => ProtocolEvent::Thinking(unescape_text(payload)),
		Tag::SendError => ProtocolEvent::SendError(send_error_message(payload)),
		Tag::Message => {
			let message: AgentMessage =
				serde_json::from_str(payload).map_err(|source| ProtocolError::MalformedJson {
					tag: tag.marker(),
					source,
				})?;
			if message.is_status() {
				ProtocolEvent::Status(message.status_text())
			} else {
				ProtocolEvent::Message(message)
			}
		}
	};
	Ok(event)
}

/// Text payloads beginning with `"` are JSON string literals so embedded
/// newlines survive the line protocol. Everything else is verbatim.
fn unescape_text(payload: &str) -> String {
	if payload.starts_with('"') {
		if let Ok(text) = serde_json::from_str::<String>(payload) {
			return text;
		}
	}
	payload.to_string()
}

fn send_error_message(payload: &str) -> String {
	let trimmed = payload.trim();
	match serde_json::from_str::<Value>(trimmed) {
		Ok(Value::String(message)) => message,
		Ok(Value::Object(map)) => ["error", "message"]
			.iter()
			.find_map(|key| match map.get(*key) {
				Some(Value::String(s)) => Some(s.clone()),
				Some(Value::Object(inner)) => inner
					.get("message")
					.and_then(Value::as_str)
					.map(str::to_string),
				_ => None,
			})
			.unwrap_or_else(|| trimmed.to_string()),
		_ => trimmed.to_string(),
	}
}

/// Render an event back into its wire line. Used by fake agents in tests and
/// by tooling that replays captured output.
pub fn encode_event(event: &ProtocolEvent) -> String {
	fn text(tag: Tag, text: &str) -> String {
		if text.contains('\n') || text.contains('\r') || text.starts_with('"') {
			let quoted = serde_json::to_string(text).unwrap_or_default();
			format!("{}{quoted}", tag.marker())
		} else {
			format!("{}{text}", tag.marker())
		}
	}

	match event {
		ProtocolEvent::MessageStart => Tag::MessageStart.marker().to_string(),
		ProtocolEvent::MessageEnd => Tag::MessageEnd.marker().to_string(),
		ProtocolEvent::ThreadId(id) => format!("{}{id}", Tag::ThreadId.marker()),
		ProtocolEvent::Message(message) => format!(
			"{}{}",
			Tag::Message.marker(),
			serde_json::to_string(message).unwrap_or_default()
		),
		ProtocolEvent::Status(status) => format!(
			"{}{}",
			Tag::Message.marker(),
			serde_json::json!({ "type": "status", "text": status })
		),
		ProtocolEvent::ContentDelta(t) => text(Tag::ContentDelta, t),
		ProtocolEvent::ThinkingDelta(t) => text(Tag::ThinkingDelta, t),
		ProtocolEvent::Content(t) => text(Tag::Content, t),
		ProtocolEvent::Thinking(t) => text(Tag::Thinking, t),
		ProtocolEvent::SendError(message) => format!(
			"{}{}",
			Tag::SendError.marker(),
			serde_json::json!({ "error": message })
		),
		ProtocolEvent::Diagnostic(diag) => diag.line.clone(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event::DiagnosticKind;
	use proptest::prelude::*;

	#[test]
	fn test_simple_tags() {
		assert_eq!(decode_line("[MESSAGE_START]"), ProtocolEvent::MessageStart);
		assert_eq!(decode_line("[MESSAGE_END]"), ProtocolEvent::MessageEnd);
		assert_eq!(
			decode_line("[THREAD_ID]thread_abc"),
			ProtocolEvent::ThreadId("thread_abc".to_string())
		);
		assert_eq!(
			decode_line("[SESSION_ID] 1b2c\r"),
			ProtocolEvent::ThreadId("1b2c".to_string())
		);
		assert_eq!(
			decode_line("[CONTENT_DELTA]Hello"),
			ProtocolEvent::ContentDelta("Hello".to_string())
		);
		assert_eq!(
			decode_line("[THINKING_DELTA]pondering"),
			ProtocolEvent::ThinkingDelta("pondering".to_string())
		);
		assert_eq!(
			decode_line("[CONTENT]Hello world"),
			ProtocolEvent::Content("Hello world".to_string())
		);
	}

	/// **Test: Delta payloads may carry JSON-escaped newlines**
	///
	/// Multi-line assistant text cannot cross a line protocol verbatim, so
	/// bridges quote it. A leading quote that is not valid JSON stays as is.
	#[test]
	fn test_quoted_delta_is_unescaped() {
		assert_eq!(
			decode_line(r#"[CONTENT_DELTA]"line one\nline two""#),
			ProtocolEvent::ContentDelta("line one\nline two".to_string())
		);
		assert_eq!(
			decode_line(r#"[CONTENT_DELTA]"unterminated"#),
			ProtocolEvent::ContentDelta("\"unterminated".to_string())
		);
	}

	#[test]
	fn test_send_error_payload_forms() {
		assert_eq!(
			decode_line(r#"[SEND_ERROR]{"error":"API key missing"}"#),
			ProtocolEvent::SendError("API key missing".to_string())
		);
		assert_eq!(
			decode_line(r#"[SEND_ERROR]{"error":{"message":"rate limited"}}"#),
			ProtocolEvent::SendError("rate limited".to_string())
		);
		assert_eq!(
			decode_line(r#"[SEND_ERROR]{"message":"bad model"}"#),
			ProtocolEvent::SendError("bad model".to_string())
		);
		assert_eq!(
			decode_line("[SEND_ERROR]connection reset"),
			ProtocolEvent::SendError("connection reset".to_string())
		);
	}

	#[test]
	fn test_message_and_status_split() {
		match decode_line(
			r#"[MESSAGE]{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"hi"}]}}"#,
		) {
			ProtocolEvent::Message(msg) => assert_eq!(msg.text(), "hi"),
			other => panic!("expected message, got {other:?}"),
		}

		assert_eq!(
			decode_line(r#"[MESSAGE]{"type":"status","text":"Thinking..."}"#),
			ProtocolEvent::Status("Thinking...".to_string())
		);
	}

	/// **Test: Malformed payloads degrade to diagnostics**
	///
	/// A protocol error is logged and skipped; it must never abort the
	/// reader or produce a partially-parsed message.
	#[test]
	fn test_malformed_message_is_diagnostic() {
		match decode_line("[MESSAGE]{not json") {
			ProtocolEvent::Diagnostic(diag) => {
				assert_eq!(diag.line, "[MESSAGE]{not json");
				assert_eq!(diag.kind, DiagnosticKind::Plain);
			}
			other => panic!("expected diagnostic, got {other:?}"),
		}
		assert!(matches!(
			decode_line("[THREAD_ID]   "),
			ProtocolEvent::Diagnostic(_)
		));
	}

	#[test]
	fn test_unknown_tag_is_diagnostic() {
		match decode_line("[TOOL_PROGRESS]50%") {
			ProtocolEvent::Diagnostic(diag) => assert_eq!(diag.line, "[TOOL_PROGRESS]50%"),
			other => panic!("expected diagnostic, got {other:?}"),
		}
		match decode_line("[UNCAUGHT_ERROR] ReferenceError: foo") {
			ProtocolEvent::Diagnostic(diag) => assert!(diag.is_error()),
			other => panic!("expected diagnostic, got {other:?}"),
		}
	}

	#[test]
	fn test_encode_multiline_content() {
		let event = ProtocolEvent::ContentDelta("a\nb".to_string());
		let line = encode_event(&event);
		assert!(!line.contains('\n'));
		assert_eq!(decode_line(&line), event);
	}

	proptest! {
		/// **Property: Tagged text payloads are extracted exactly**
		///
		/// **Why Important**: Every streamed character reaches the transcript
		/// through this path. Losing or altering one corrupts the turn.
		#[test]
		fn tagged_payload_extracted_exactly(payload in "[^\"\r\n][^\r\n]{0,80}") {
			let line = format!("[CONTENT_DELTA]{payload}");
			prop_assert_eq!(decode_line(&line), ProtocolEvent::ContentDelta(payload.clone()));
			let line = format!("[CONTENT]{payload}");
			prop_assert_eq!(decode_line(&line), ProtocolEvent::Content(payload));
		}

		/// **Property: The decoder never panics**
		///
		/// **Why Important**: Agent processes print arbitrary stack traces and
		/// partial JSON. The reader thread must survive all of it.
		#[test]
		fn decode_never_panics(line in "\\PC{0,200}") {
			let _ = decode_line(&line);
		}

		/// **Property: Untagged lines are diagnostics carrying the whole line**
		#[test]
		fn untagged_lines_are_diagnostics(line in "[^\\[\r][^\r]{0,80}") {
			match decode_line(&line) {
				ProtocolEvent::Diagnostic(diag) => prop_assert_eq!(diag.line, line),
				other => prop_assert!(false, "unexpected {:?}", other),
			}
		}
	}
}
