// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use std::path::PathBuf;

/// Presentation surface failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SurfaceError {
	/// The surface exists but cannot display anything yet. Retried.
	#[error("presentation surface not ready")]
	NotReady,

	/// The surface is gone. Not retried.
	#[error("presentation surface closed: {0}")]
	Closed(String),
}

/// File transport failures. Correlator operations themselves never fail.
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("malformed permission request {path}: {source}")]
	MalformedRequest {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},

	#[error("failed to encode permission response: {0}")]
	Encode(#[source] serde_json::Error),
}

pub type PermissionResult<T> = Result<T, PermissionError>;
