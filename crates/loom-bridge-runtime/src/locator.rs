// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use std::path::PathBuf;

use crate::bundle::has_runtime_structure;

/// Tells the launcher where the bridge runtime lives.
pub trait RuntimeLocator: Send + Sync {
	/// The runtime directory, or `None` if it is not available yet.
	fn find_runtime_dir(&self) -> Option<PathBuf>;

	fn is_ready(&self) -> bool;
}

/// A pre-installed runtime directory, e.g. from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRuntime {
	dir: PathBuf,
}

impl StaticRuntime {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self { dir: dir.into() }
	}
}

impl RuntimeLocator for StaticRuntime {
	fn find_runtime_dir(&self) -> Option<PathBuf> {
		self.is_ready().then(|| self.dir.clone())
	}

	fn is_ready(&self) -> bool {
		has_runtime_structure(&self.dir)
	}
}
