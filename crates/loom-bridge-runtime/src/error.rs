// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use std::path::PathBuf;
use std::sync::Arc;

/// Runtime acquisition failures.
///
/// Cloneable because one failure is handed to every caller waiting on the
/// same extraction.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GateError {
	#[error("I/O error at {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: Arc<std::io::Error>,
	},

	#[error("failed to read bundle archive {path}: {message}")]
	Archive { path: PathBuf, message: String },

	#[error("invalid runtime bundle: {0}")]
	InvalidBundle(String),

	#[error("extraction worker exited without a result")]
	WorkerGone,
}

impl GateError {
	pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		Self::Io {
			path: path.into(),
			source: Arc::new(source),
		}
	}
}

pub type GateResult<T> = Result<T, GateError>;
