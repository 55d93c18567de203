// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Permission correlation for bridged agents.
//!
//! An agent asks for approval, the user decides later (or never). The
//! [`PermissionCorrelator`] holds one single-resolution slot per request,
//! keyed by a channel id, and resolves it with the first of an explicit
//! decision or the request kind's deadline.

pub mod correlator;
pub mod error;
pub mod prompt;
pub mod surface;
pub mod watcher;

pub use correlator::{CorrelatorConfig, PendingApproval, PermissionCorrelator};
pub use error::{PermissionError, PermissionResult, SurfaceError};
pub use prompt::{
	PermissionDecision, PermissionOutcome, PermissionPrompt, PermissionRequest, PromptKind,
};
pub use surface::{HeadlessSurface, PromptSurface};
pub use watcher::{write_response, FileRequest, FileResponse, PermissionDirectory, PermissionWatcher};
