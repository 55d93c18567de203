// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Runtime acquisition for the agent bridge.
//!
//! The bridge scripts ship as a zip archive that is unpacked once per
//! version. [`RuntimeGate`] guarantees a single extraction no matter how many
//! callers race for it, skips extraction entirely when a valid tree with a
//! matching signature already exists, and lets a failed attempt be retried by
//! the next caller.

pub mod bundle;
pub mod error;
pub mod extract;
pub mod gate;
pub mod locator;

pub use bundle::{
	has_runtime_structure, is_valid_runtime_dir, BundleSource, DEPENDENCY_DIR, ENTRY_SCRIPT,
	SIGNATURE_FILE,
};
pub use error::{GateError, GateResult};
pub use extract::{safe_entry_path, BundleExtractor, ZipExtractor};
pub use gate::{Acquisition, ExtractionState, RuntimeGate, SharedAcquire};
pub use locator::{RuntimeLocator, StaticRuntime};
