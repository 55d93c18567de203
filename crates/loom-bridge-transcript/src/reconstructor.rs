// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use loom_bridge_protocol::{AgentMessage, ProtocolEvent};
use serde::Serialize;
use tracing::trace;

use crate::segment::{Segment, StreamingTranscript};
use crate::throttle::{Throttle, DEFAULT_INTERVAL};

/// Events the reconstructor consumes, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
	/// A new user turn; everything from the previous turn is discarded.
	TurnStarted,
	MessageStart,
	ContentDelta(String),
	ThinkingDelta(String),
	/// Full message list; the latest assistant message is used.
	Snapshot(Vec<AgentMessage>),
	MessageEnd,
}

impl TranscriptEvent {
	/// Map a wire event to a transcript event, if it affects the transcript.
	///
	/// Aggregated `Content`/`Thinking` snapshots are not mapped: they carry
	/// no block structure and would flatten interleaved segments.
	pub fn from_protocol(event: &ProtocolEvent) -> Option<Self> {
		match event {
			ProtocolEvent::MessageStart => Some(TranscriptEvent::MessageStart),
			ProtocolEvent::MessageEnd => Some(TranscriptEvent::MessageEnd),
			ProtocolEvent::ContentDelta(text) => Some(TranscriptEvent::ContentDelta(text.clone())),
			ProtocolEvent::ThinkingDelta(text) => Some(TranscriptEvent::ThinkingDelta(text.clone())),
			ProtocolEvent::Message(message) if message.is_assistant() => {
				Some(TranscriptEvent::Snapshot(vec![message.clone()]))
			}
			_ => None,
		}
	}
}

/// What a view renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptSnapshot {
	pub segments: Vec<Segment>,
	pub is_streaming: bool,
	/// Increases with every render.
	pub revision: u64,
}

impl TranscriptSnapshot {
	pub fn text(&self) -> String {
		self.segments
			.iter()
			.filter(|s| s.kind == crate::segment::SegmentKind::Text)
			.map(|s| s.text.as_str())
			.collect()
	}
}

/// Render sink. Implementations marshal onto their presentation thread.
pub trait TranscriptView: Send + Sync {
	fn render(&self, snapshot: &TranscriptSnapshot);
}

struct Shared {
	transcript: StreamingTranscript,
	revision: u64,
}

/// Applies events to a [`StreamingTranscript`] and renders it through a
/// throttle, flushing on message end so the final state is always shown.
///
/// Must be driven from within a tokio runtime.
pub struct TranscriptReconstructor {
	shared: Arc<Mutex<Shared>>,
	throttle: Throttle,
}

impl std::fmt::Debug for TranscriptReconstructor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TranscriptReconstructor")
			.field("throttle", &self.throttle)
			.finish_non_exhaustive()
	}
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
	shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TranscriptReconstructor {
	pub fn new(view: Arc<dyn TranscriptView>) -> Self {
		Self::with_interval(view, DEFAULT_INTERVAL)
	}

	pub fn with_interval(view: Arc<dyn TranscriptView>, interval: Duration) -> Self {
		let shared = Arc::new(Mutex::new(Shared {
			transcript: StreamingTranscript::new(),
			revision: 0,
		}));
		let render = {
			let shared = Arc::clone(&shared);
			move || {
				let snapshot = {
					let mut guard = lock(&shared);
					guard.revision += 1;
					TranscriptSnapshot {
						segments: guard.transcript.segments(),
						is_streaming: guard.transcript.is_streaming(),
						revision: guard.revision,
					}
				};
				view.render(&snapshot);
			}
		};
		Self {
			shared,
			throttle: Throttle::new(interval, render),
		}
	}

	pub fn handle(&self, event: TranscriptEvent) {
		trace!(event = ?event, "transcript event");
		match event {
			TranscriptEvent::TurnStarted => {
				self.throttle.cancel();
				lock(&self.shared).transcript.reset();
			}
			TranscriptEvent::MessageStart => {
				lock(&self.shared).transcript.start_message();
				self.throttle.request();
			}
			TranscriptEvent::ContentDelta(text) => {
				lock(&self.shared).transcript.apply_content_delta(&text);
				self.throttle.request();
			}
			TranscriptEvent::ThinkingDelta(text) => {
				lock(&self.shared).transcript.apply_thinking_delta(&text);
				self.throttle.request();
			}
			TranscriptEvent::Snapshot(messages) => {
				let streaming = {
					let mut guard = lock(&self.shared);
					guard.transcript.apply_snapshot(&messages);
					guard.transcript.is_streaming()
				};
				if streaming {
					self.throttle.request();
				} else {
					self.throttle.flush();
				}
			}
			TranscriptEvent::MessageEnd => {
				lock(&self.shared).transcript.finish();
				self.throttle.flush();
			}
		}
	}

	/// Feed a wire event; events that do not affect the transcript are ignored.
	pub fn handle_protocol(&self, event: &ProtocolEvent) {
		if let Some(event) = TranscriptEvent::from_protocol(event) {
			self.handle(event);
		}
	}

	/// Current state, bypassing the throttle.
	pub fn current(&self) -> TranscriptSnapshot {
		let guard = lock(&self.shared);
		TranscriptSnapshot {
			segments: guard.transcript.segments(),
			is_streaming: guard.transcript.is_streaming(),
			revision: guard.revision,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::segment::SegmentKind;

	#[derive(Default)]
	struct RecordingView {
		renders: Mutex<Vec<TranscriptSnapshot>>,
	}

	impl RecordingView {
		fn last(&self) -> Option<TranscriptSnapshot> {
			self.renders.lock().unwrap().last().cloned()
		}

		fn count(&self) -> usize {
			self.renders.lock().unwrap().len()
		}
	}

	impl TranscriptView for RecordingView {
		fn render(&self, snapshot: &TranscriptSnapshot) {
			self.renders.lock().unwrap().push(snapshot.clone());
		}
	}

	fn setup() -> (TranscriptReconstructor, Arc<RecordingView>) {
		let view = Arc::new(RecordingView::default());
		(TranscriptReconstructor::new(view.clone()), view)
	}

	/// **Test: The last delta is always rendered**
	///
	/// Deltas arriving faster than the throttle interval are coalesced, but
	/// message end flushes so the final render carries the full text and
	/// `is_streaming == false`.
	#[tokio::test(start_paused = true)]
	async fn test_final_render_has_full_text() {
		let (r, view) = setup();
		r.handle(TranscriptEvent::TurnStarted);
		r.handle(TranscriptEvent::MessageStart);
		r.handle(TranscriptEvent::ContentDelta("Hello".to_string()));
		r.handle(TranscriptEvent::ContentDelta(" world".to_string()));
		r.handle(TranscriptEvent::MessageEnd);

		let last = view.last().unwrap();
		assert!(!last.is_streaming);
		assert_eq!(last.segments.len(), 1);
		assert_eq!(last.segments[0].kind, SegmentKind::Text);
		assert_eq!(last.text(), "Hello world");
		assert!(view.count() <= 2);
	}

	/// **Test: Without message end, the trailing timer still renders**
	#[tokio::test(start_paused = true)]
	async fn test_trailing_render_without_end() {
		let (r, view) = setup();
		r.handle(TranscriptEvent::ContentDelta("a".to_string()));
		r.handle(TranscriptEvent::ContentDelta("b".to_string()));
		r.handle(TranscriptEvent::ContentDelta("c".to_string()));
		assert_eq!(view.last().unwrap().text(), "a");

		tokio::time::sleep(Duration::from_millis(51)).await;
		tokio::task::yield_now().await;
		let last = view.last().unwrap();
		assert_eq!(last.text(), "abc");
		assert!(last.is_streaming);
	}

	/// **Test: A new turn discards pending renders from the previous one**
	///
	/// A trailing timer armed for the old turn must not repaint stale text
	/// after the new turn has started.
	#[tokio::test(start_paused = true)]
	async fn test_turn_started_cancels_stale_render() {
		let (r, view) = setup();
		r.handle(TranscriptEvent::ContentDelta("old".to_string()));
		r.handle(TranscriptEvent::ContentDelta(" text".to_string()));
		let before = view.count();

		r.handle(TranscriptEvent::TurnStarted);
		tokio::time::sleep(Duration::from_millis(200)).await;
		assert_eq!(view.count(), before);
		assert!(r.current().segments.is_empty());

		r.handle(TranscriptEvent::ContentDelta("new".to_string()));
		assert_eq!(view.last().unwrap().text(), "new");
	}

	#[tokio::test(start_paused = true)]
	async fn test_interleaved_render_order() {
		let (r, view) = setup();
		r.handle(TranscriptEvent::MessageStart);
		r.handle(TranscriptEvent::ThinkingDelta("a".to_string()));
		r.handle(TranscriptEvent::ContentDelta("b".to_string()));
		r.handle(TranscriptEvent::ThinkingDelta("c".to_string()));
		r.handle(TranscriptEvent::MessageEnd);

		let kinds: Vec<SegmentKind> = view.last().unwrap().segments.iter().map(|s| s.kind).collect();
		assert_eq!(
			kinds,
			vec![SegmentKind::Thinking, SegmentKind::Text, SegmentKind::Thinking]
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_protocol_events_drive_transcript() {
		let (r, view) = setup();
		for line in [
			"[MESSAGE_START]",
			"[THINKING_DELTA]hmm",
			"[CONTENT_DELTA]Done",
			"[CONTENT]Done",
			"[DEBUG] noise",
			r#"[MESSAGE]{"type":"assistant","message":{"role":"assistant","content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"Done."}]}}"#,
			"[MESSAGE_END]",
		] {
			r.handle_protocol(&loom_bridge_protocol::decode_line(line));
		}
		let last = view.last().unwrap();
		assert!(!last.is_streaming);
		assert_eq!(last.text(), "Done.");
		assert_eq!(last.segments[0].text, "hmm");
	}
}
