// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! The in-progress assistant turn as ordered segments.
//!
//! Deltas build segments directly. A delta of one kind appends to the active
//! segment of that kind unless the other kind was written last, in which
//! case it opens a new segment; this is how interleaved thinking and text
//! phases are represented without phase markers from the backend.
//!
//! Snapshots are authoritative but, while streaming, the n-th delta-built
//! segment of a kind is trusted over the snapshot's n-th block of that kind.
//! On message end the last snapshot replaces everything.

use loom_bridge_protocol::{AgentMessage, ContentBlock};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
	Thinking,
	Text,
	/// Tool invocation; only ever comes from snapshots.
	ToolUse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
	pub kind: SegmentKind,
	pub text: String,
	/// Built from deltas rather than taken from a snapshot.
	#[serde(skip)]
	pub from_delta: bool,
}

impl Segment {
	fn snapshot(kind: SegmentKind, text: impl Into<String>) -> Self {
		Self {
			kind,
			text: text.into(),
			from_delta: false,
		}
	}

	/// Segments for each block of a message, skipping tool results and
	/// unknown blocks.
	pub fn from_message(message: &AgentMessage) -> Vec<Segment> {
		message
			.blocks()
			.into_iter()
			.filter_map(|block| match block {
				ContentBlock::Text { text } => Some(Segment::snapshot(SegmentKind::Text, text)),
				ContentBlock::Thinking { thinking } => {
					Some(Segment::snapshot(SegmentKind::Thinking, thinking))
				}
				ContentBlock::ToolUse { name, .. } => Some(Segment::snapshot(SegmentKind::ToolUse, name)),
				ContentBlock::ToolResult { .. } | ContentBlock::Unknown => None,
			})
			.collect()
	}
}

#[derive(Debug, Clone, Default)]
pub struct StreamingTranscript {
	segments: Vec<Segment>,
	text_indices: Vec<usize>,
	thinking_indices: Vec<usize>,
	active_text: Option<usize>,
	active_thinking: Option<usize>,
	last_delta: Option<SegmentKind>,
	snapshot: Option<Vec<Segment>>,
	is_streaming: bool,
}

impl StreamingTranscript {
	pub fn new() -> Self {
		Self::default()
	}

	/// Drop everything from the previous turn.
	pub fn reset(&mut self) {
		*self = Self::default();
	}

	pub fn start_message(&mut self) {
		if !self.is_streaming {
			self.reset();
			self.is_streaming = true;
		}
	}

	pub fn is_streaming(&self) -> bool {
		self.is_streaming
	}

	pub fn apply_content_delta(&mut self, text: &str) {
		self.apply_delta(SegmentKind::Text, text);
	}

	pub fn apply_thinking_delta(&mut self, text: &str) {
		self.apply_delta(SegmentKind::Thinking, text);
	}

	fn apply_delta(&mut self, kind: SegmentKind, text: &str) {
		// A delta without a preceding MessageStart resumes streaming on top of
		// whatever is already shown.
		if !self.is_streaming {
			self.is_streaming = true;
		}

		let active = match kind {
			SegmentKind::Text => self.active_text,
			SegmentKind::Thinking => self.active_thinking,
			SegmentKind::ToolUse => None,
		};
		let continues = self.last_delta == Some(kind) && active.is_some();

		match (continues, active) {
			(true, Some(index)) => self.segments[index].text.push_str(text),
			_ => {
				let index = self.segments.len();
				self.segments.push(Segment {
					kind,
					text: text.to_string(),
					from_delta: true,
				});
				match kind {
					SegmentKind::Text => {
						self.text_indices.push(index);
						self.active_text = Some(index);
					}
					SegmentKind::Thinking => {
						self.thinking_indices.push(index);
						self.active_thinking = Some(index);
					}
					SegmentKind::ToolUse => {}
				}
			}
		}
		self.last_delta = Some(kind);
	}

	/// Record the latest assistant message from a full message list.
	pub fn apply_snapshot(&mut self, messages: &[AgentMessage]) {
		let Some(latest) = messages.iter().rev().find(|m| m.is_assistant()) else {
			return;
		};
		let blocks = Segment::from_message(latest);
		if self.is_streaming {
			self.snapshot = Some(blocks);
		} else {
			self.install(blocks);
		}
	}

	/// Freeze the turn. The last snapshot wins over delta state.
	pub fn finish(&mut self) {
		if let Some(blocks) = self.snapshot.take() {
			self.install(blocks);
		}
		for segment in &mut self.segments {
			segment.from_delta = false;
		}
		self.active_text = None;
		self.active_thinking = None;
		self.last_delta = None;
		self.is_streaming = false;
	}

	fn install(&mut self, blocks: Vec<Segment>) {
		self.segments = blocks;
		self.rebuild_indices();
		self.active_text = None;
		self.active_thinking = None;
		self.last_delta = None;
	}

	fn rebuild_indices(&mut self) {
		self.text_indices.clear();
		self.thinking_indices.clear();
		for (index, segment) in self.segments.iter().enumerate() {
			match segment.kind {
				SegmentKind::Text => self.text_indices.push(index),
				SegmentKind::Thinking => self.thinking_indices.push(index),
				SegmentKind::ToolUse => {}
			}
		}
	}

	/// The segments to display, merging any pending snapshot.
	///
	/// Snapshot order wins. Thinking and text blocks are matched to delta
	/// segments by their ordinal within the kind, so tool blocks the deltas
	/// never saw do not shift the pairing. Delta segments the snapshot has
	/// not caught up with yet follow in the order they were written.
	pub fn segments(&self) -> Vec<Segment> {
		let Some(snapshot) = self.snapshot.as_ref() else {
			return self.segments.clone();
		};
		let mut merged = Vec::with_capacity(snapshot.len().max(self.segments.len()));
		let (mut text_seen, mut thinking_seen) = (0, 0);
		for block in snapshot {
			let delta = match block.kind {
				SegmentKind::Text => {
					text_seen += 1;
					self.delta_at(&self.text_indices, text_seen - 1)
				}
				SegmentKind::Thinking => {
					thinking_seen += 1;
					self.delta_at(&self.thinking_indices, thinking_seen - 1)
				}
				SegmentKind::ToolUse => None,
			};
			merged.push(delta.unwrap_or(block).clone());
		}

		let unmatched_text = self.text_indices.iter().skip(text_seen);
		let unmatched_thinking = self.thinking_indices.iter().skip(thinking_seen);
		let mut rest: Vec<usize> = unmatched_text.chain(unmatched_thinking).copied().collect();
		rest.sort_unstable();
		merged.extend(rest.into_iter().filter_map(|i| self.segments.get(i)).cloned());
		merged
	}

	fn delta_at(&self, indices: &[usize], ordinal: usize) -> Option<&Segment> {
		indices
			.get(ordinal)
			.and_then(|&i| self.segments.get(i))
			.filter(|segment| segment.from_delta)
	}

	pub fn text_segments(&self) -> Vec<String> {
		self.text_indices
			.iter()
			.filter_map(|&i| self.segments.get(i))
			.map(|s| s.text.clone())
			.collect()
	}

	pub fn thinking_segments(&self) -> Vec<String> {
		self.thinking_indices
			.iter()
			.filter_map(|&i| self.segments.get(i))
			.map(|s| s.text.clone())
			.collect()
	}

	/// All text segments joined, as shown in the finalized message.
	pub fn text(&self) -> String {
		self.segments()
			.iter()
			.filter(|s| s.kind == SegmentKind::Text)
			.map(|s| s.text.as_str())
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	fn assistant(blocks: serde_json::Value) -> AgentMessage {
		serde_json::from_value(serde_json::json!({
			"type": "assistant",
			"message": { "role": "assistant", "content": blocks }
		}))
		.unwrap()
	}

	/// **Test: Content deltas finalize into one text segment**
	#[test]
	fn test_hello_world() {
		let mut t = StreamingTranscript::new();
		t.apply_content_delta("Hello");
		t.apply_content_delta(" world");
		assert!(t.is_streaming());
		t.finish();

		assert!(!t.is_streaming());
		assert_eq!(t.text_segments(), vec!["Hello world".to_string()]);
		assert_eq!(t.segments().len(), 1);
		assert_eq!(t.text(), "Hello world");
	}

	/// **Test: Interleaved phases open new segments in order**
	///
	/// Thinking, text, thinking must produce two thinking segments and one
	/// text segment, ordered a, b, c, without explicit phase markers.
	#[test]
	fn test_interleaved_thinking_and_text() {
		let mut t = StreamingTranscript::new();
		t.start_message();
		t.apply_thinking_delta("a");
		t.apply_content_delta("b");
		t.apply_thinking_delta("c");

		assert_eq!(t.thinking_segments(), vec!["a".to_string(), "c".to_string()]);
		assert_eq!(t.text_segments(), vec!["b".to_string()]);
		let order: Vec<(SegmentKind, String)> =
			t.segments().into_iter().map(|s| (s.kind, s.text)).collect();
		assert_eq!(
			order,
			vec![
				(SegmentKind::Thinking, "a".to_string()),
				(SegmentKind::Text, "b".to_string()),
				(SegmentKind::Thinking, "c".to_string()),
			]
		);
	}

	/// **Test: While streaming, delta segments beat snapshot blocks**
	///
	/// A snapshot lagging behind the deltas must not make visible text jump
	/// backwards. Positions the deltas have not reached come from the
	/// snapshot.
	#[test]
	fn test_streaming_merge_keeps_deltas() {
		let mut t = StreamingTranscript::new();
		t.start_message();
		t.apply_thinking_delta("planning the change");
		t.apply_snapshot(&[assistant(serde_json::json!([
			{"type": "thinking", "thinking": "planning"},
			{"type": "tool_use", "id": "t1", "name": "Edit", "input": {}}
		]))]);

		let merged = t.segments();
		assert_eq!(merged.len(), 2);
		assert_eq!(merged[0].text, "planning the change");
		assert_eq!(merged[1].kind, SegmentKind::ToolUse);
		assert_eq!(merged[1].text, "Edit");
	}

	/// **Test: A tool block does not shift the delta pairing**
	///
	/// The snapshot carries a tool call between the thinking and text blocks
	/// that no delta ever announced. The text delta must land on the text
	/// block, not replace the tool call.
	#[test]
	fn test_tool_use_block_does_not_shift_merge() {
		let mut t = StreamingTranscript::new();
		t.start_message();
		t.apply_thinking_delta("a");
		t.apply_content_delta("b");
		t.apply_snapshot(&[assistant(serde_json::json!([
			{"type": "thinking", "thinking": "a"},
			{"type": "tool_use", "id": "t1", "name": "Bash", "input": {}},
			{"type": "text", "text": "b"}
		]))]);

		let order: Vec<(SegmentKind, String)> =
			t.segments().into_iter().map(|s| (s.kind, s.text)).collect();
		assert_eq!(
			order,
			vec![
				(SegmentKind::Thinking, "a".to_string()),
				(SegmentKind::ToolUse, "Bash".to_string()),
				(SegmentKind::Text, "b".to_string()),
			]
		);
		assert_eq!(t.text(), "b");
	}

	/// **Test: Deltas ahead of the snapshot follow it in write order**
	#[test]
	fn test_merge_appends_deltas_past_snapshot() {
		let mut t = StreamingTranscript::new();
		t.start_message();
		t.apply_thinking_delta("plan");
		t.apply_content_delta("first");
		t.apply_thinking_delta("more");
		t.apply_snapshot(&[assistant(serde_json::json!([
			{"type": "thinking", "thinking": "pl"},
			{"type": "tool_use", "id": "t1", "name": "Read", "input": {}}
		]))]);

		let order: Vec<(SegmentKind, String)> =
			t.segments().into_iter().map(|s| (s.kind, s.text)).collect();
		assert_eq!(
			order,
			vec![
				(SegmentKind::Thinking, "plan".to_string()),
				(SegmentKind::ToolUse, "Read".to_string()),
				(SegmentKind::Text, "first".to_string()),
				(SegmentKind::Thinking, "more".to_string()),
			]
		);
	}

	/// **Test: A late delta after message end keeps the finished text**
	///
	/// Without a fresh MessageStart the delta continues the message on
	/// screen instead of wiping it.
	#[test]
	fn test_late_delta_after_finish_appends() {
		let mut t = StreamingTranscript::new();
		t.start_message();
		t.apply_content_delta("Hello");
		t.finish();

		t.apply_content_delta(" again");
		assert!(t.is_streaming());
		assert_eq!(t.text(), "Hello again");
		assert_eq!(t.text_segments(), vec!["Hello".to_string(), " again".to_string()]);

		t.finish();
		assert_eq!(t.text(), "Hello again");
	}

	/// **Test: On message end the snapshot is authoritative**
	#[test]
	fn test_finish_installs_snapshot() {
		let mut t = StreamingTranscript::new();
		t.start_message();
		t.apply_content_delta("Hel");
		t.apply_snapshot(&[assistant(serde_json::json!([
			{"type": "thinking", "thinking": "t"},
			{"type": "text", "text": "Hello there"}
		]))]);
		t.finish();

		assert_eq!(t.text_segments(), vec!["Hello there".to_string()]);
		assert_eq!(t.thinking_segments(), vec!["t".to_string()]);
		assert!(t.segments().iter().all(|s| !s.from_delta));
	}

	#[test]
	fn test_snapshot_outside_streaming_replaces() {
		let mut t = StreamingTranscript::new();
		t.apply_snapshot(&[
			assistant(serde_json::json!([{"type": "text", "text": "old"}])),
			serde_json::from_value(serde_json::json!({
				"type": "user",
				"message": {"role": "user", "content": "next"}
			}))
			.unwrap(),
		]);
		assert_eq!(t.text(), "old");
		assert!(!t.is_streaming());
	}

	#[test]
	fn test_reset_clears_everything() {
		let mut t = StreamingTranscript::new();
		t.apply_content_delta("left over");
		t.reset();
		assert!(t.segments().is_empty());
		assert!(!t.is_streaming());
		t.apply_content_delta("new");
		assert_eq!(t.text_segments(), vec!["new".to_string()]);
	}

	proptest! {
		/// **Property: Finalized text is the in-order concatenation of deltas**
		///
		/// **Why Important**: Dropping, duplicating, or reordering a streamed
		/// fragment is exactly the failure this component exists to prevent.
		#[test]
		fn finalized_text_is_concatenation(deltas in prop::collection::vec("\\PC{0,12}", 0..40)) {
			let mut t = StreamingTranscript::new();
			t.start_message();
			for d in &deltas {
				t.apply_content_delta(d);
			}
			t.finish();
			prop_assert_eq!(t.text(), deltas.concat());
			prop_assert!(t.text_segments().len() <= 1);
		}

		/// **Property: Interleaving never loses fragments of either kind**
		#[test]
		fn interleaving_preserves_each_kind(ops in prop::collection::vec((any::<bool>(), "[a-z]{1,4}"), 0..40)) {
			let mut t = StreamingTranscript::new();
			for (thinking, text) in &ops {
				if *thinking {
					t.apply_thinking_delta(text);
				} else {
					t.apply_content_delta(text);
				}
			}
			let thinking: String = ops.iter().filter(|(k, _)| *k).map(|(_, s)| s.as_str()).collect();
			let text: String = ops.iter().filter(|(k, _)| !*k).map(|(_, s)| s.as_str()).collect();
			prop_assert_eq!(t.thinking_segments().concat(), thinking);
			prop_assert_eq!(t.text_segments().concat(), text);
		}
	}
}
