// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Client-side transcript reconstruction.
//!
//! The backend may emit full message snapshots, incremental content and
//! thinking deltas, or both. [`TranscriptReconstructor`] turns either mode
//! into one ordered view of the current assistant turn without dropping,
//! duplicating, or visibly reordering text, and renders it at most once per
//! throttle interval.

pub mod reconstructor;
pub mod segment;
pub mod throttle;

pub use reconstructor::{TranscriptEvent, TranscriptReconstructor, TranscriptSnapshot, TranscriptView};
pub use segment::{Segment, SegmentKind, StreamingTranscript};
pub use throttle::{Throttle, DEFAULT_INTERVAL};
