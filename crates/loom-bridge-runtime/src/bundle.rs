// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Bundle layout, signature, and structural validation.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{GateError, GateResult};

/// Entry script the launcher runs, relative to the runtime dir.
pub const ENTRY_SCRIPT: &str = "bridge/index.js";
/// Dependency subtree that must exist next to the entry script.
pub const DEPENDENCY_DIR: &str = "bridge/node_modules";
/// Marker recording which archive produced the extracted tree.
pub const SIGNATURE_FILE: &str = ".bundle-signature";

/// Where the packaged bundle lives and where it is unpacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSource {
	pub archive: PathBuf,
	pub version: String,
	pub install_root: PathBuf,
}

impl BundleSource {
	pub fn new(archive: impl Into<PathBuf>, version: impl Into<String>, install_root: impl Into<PathBuf>) -> Self {
		Self {
			archive: archive.into(),
			version: version.into(),
			install_root: install_root.into(),
		}
	}

	/// Directory the bundle is extracted into.
	pub fn target_dir(&self) -> PathBuf {
		self.install_root.join(format!("bridge-{}", self.version))
	}

	/// Precomputed hash file shipped next to the archive.
	pub fn hash_file(&self) -> PathBuf {
		let mut name = self.archive.as_os_str().to_owned();
		name.push(".sha256");
		PathBuf::from(name)
	}

	/// `"<version>:<sha256>"`, preferring the precomputed hash file over
	/// hashing the archive.
	pub fn signature(&self) -> GateResult<String> {
		let hash = match read_hash_file(&self.hash_file())? {
			Some(hash) => hash,
			None => {
				debug!(archive = %self.archive.display(), "no precomputed hash; hashing archive");
				hash_archive(&self.archive)?
			}
		};
		Ok(format!("{}:{hash}", self.version))
	}
}

fn read_hash_file(path: &Path) -> GateResult<Option<String>> {
	match std::fs::read_to_string(path) {
		Ok(contents) => Ok(contents
			.split_whitespace()
			.next()
			.map(|h| h.to_ascii_lowercase())),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(GateError::io(path, e)),
	}
}

fn hash_archive(path: &Path) -> GateResult<String> {
	let file = File::open(path).map_err(|e| GateError::io(path, e))?;
	let mut reader = BufReader::new(file);
	let mut hasher = Sha256::new();
	let mut buf = [0u8; 64 * 1024];
	loop {
		let n = reader.read(&mut buf).map_err(|e| GateError::io(path, e))?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
	}
	Ok(hex::encode(hasher.finalize()))
}

/// Whether `dir` holds a complete tree produced from `signature`.
pub fn is_valid_runtime_dir(dir: &Path, signature: &str) -> bool {
	if !has_runtime_structure(dir) {
		return false;
	}
	match std::fs::read_to_string(dir.join(SIGNATURE_FILE)) {
		Ok(found) if found.trim() == signature => true,
		Ok(found) => {
			debug!(dir = %dir.display(), expected = signature, found = found.trim(), "bundle signature mismatch");
			false
		}
		Err(_) => false,
	}
}

/// Entry script and dependency subtree present.
pub fn has_runtime_structure(dir: &Path) -> bool {
	dir.join(ENTRY_SCRIPT).is_file() && dir.join(DEPENDENCY_DIR).is_dir()
}

pub fn write_signature(dir: &Path, signature: &str) -> GateResult<()> {
	let path = dir.join(SIGNATURE_FILE);
	std::fs::write(&path, signature).map_err(|e| GateError::io(path, e))
}
