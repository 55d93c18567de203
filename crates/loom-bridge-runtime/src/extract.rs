// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Archive extraction.

use std::fs::File;
use std::path::{Component, Path, PathBuf};

use tracing::{info, warn};

use crate::bundle::{write_signature, BundleSource};
use crate::error::{GateError, GateResult};

/// Unpacks a bundle into its target directory. Runs on a blocking thread.
pub trait BundleExtractor: Send + Sync + 'static {
	/// Produce a complete tree at `target` stamped with `signature`. Any
	/// previous contents of `target` may be replaced.
	fn extract(&self, source: &BundleSource, target: &Path, signature: &str) -> GateResult<()>;
}

/// Extracts a zip archive into a staging directory, then renames it into
/// place so a crash never leaves a partial tree at the target path.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipExtractor;

impl BundleExtractor for ZipExtractor {
	fn extract(&self, source: &BundleSource, target: &Path, signature: &str) -> GateResult<()> {
		let parent = target
			.parent()
			.ok_or_else(|| GateError::InvalidBundle(format!("target has no parent: {}", target.display())))?;
		std::fs::create_dir_all(parent).map_err(|e| GateError::io(parent, e))?;

		let name = target
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_else(|| "bridge".to_string());
		let staging = parent.join(format!(".{name}.staging"));
		remove_dir_if_exists(&staging)?;
		std::fs::create_dir_all(&staging).map_err(|e| GateError::io(&staging, e))?;

		if let Err(e) = unpack_zip(&source.archive, &staging) {
			let _ = std::fs::remove_dir_all(&staging);
			return Err(e);
		}
		write_signature(&staging, signature)?;

		remove_dir_if_exists(target)?;
		std::fs::rename(&staging, target).map_err(|e| GateError::io(target, e))?;
		info!(archive = %source.archive.display(), target = %target.display(), "runtime bundle extracted");
		Ok(())
	}
}

fn remove_dir_if_exists(dir: &Path) -> GateResult<()> {
	match std::fs::remove_dir_all(dir) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(GateError::io(dir, e)),
	}
}

/// Resolve an archive entry name below `dest`, rejecting anything that
/// could land outside it.
pub fn safe_entry_path(dest: &Path, entry_name: &str) -> GateResult<PathBuf> {
	if entry_name.contains('\0') {
		return Err(GateError::InvalidBundle(format!("entry name contains NUL: {entry_name:?}")));
	}
	let entry = Path::new(entry_name);
	let mut out = dest.to_path_buf();
	for component in entry.components() {
		match component {
			Component::Normal(part) => out.push(part),
			Component::CurDir => {}
			Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
				return Err(GateError::InvalidBundle(format!("unsafe entry path: {entry_name}")));
			}
		}
	}
	if out == dest {
		return Err(GateError::InvalidBundle(format!("empty entry path: {entry_name:?}")));
	}
	Ok(out)
}

fn unpack_zip(archive_path: &Path, dest: &Path) -> GateResult<()> {
	let archive_err = |e: zip::result::ZipError| GateError::Archive {
		path: archive_path.to_path_buf(),
		message: e.to_string(),
	};

	let file = File::open(archive_path).map_err(|e| GateError::io(archive_path, e))?;
	let mut archive = zip::ZipArchive::new(file).map_err(archive_err)?;

	for i in 0..archive.len() {
		let mut entry = archive.by_index(i).map_err(archive_err)?;
		let entry_name = entry.name().to_string();

		if entry.unix_mode().is_some_and(|mode| mode & 0o170000 == 0o120000) {
			warn!(entry = %entry_name, "skipping symlink in runtime bundle");
			continue;
		}

		let out = safe_entry_path(dest, &entry_name)?;
		if entry.is_dir() {
			std::fs::create_dir_all(&out).map_err(|e| GateError::io(&out, e))?;
			continue;
		}

		if let Some(parent) = out.parent() {
			std::fs::create_dir_all(parent).map_err(|e| GateError::io(parent, e))?;
		}
		let mut outfile = File::create(&out).map_err(|e| GateError::io(&out, e))?;
		std::io::copy(&mut entry, &mut outfile).map_err(|e| GateError::io(&out, e))?;

		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			if let Some(mode) = entry.unix_mode() {
				let _ = std::fs::set_permissions(&out, std::fs::Permissions::from_mode(mode));
			}
		}
	}
	Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::bundle::{is_valid_runtime_dir, DEPENDENCY_DIR, ENTRY_SCRIPT};
	use std::io::Write;

	/// Write a minimal valid bundle archive at `path`.
	pub(crate) fn write_bundle(path: &Path) {
		write_zip(
			path,
			&[
				(ENTRY_SCRIPT, Some("console.log('bridge')")),
				("bridge/node_modules/", None),
				("bridge/node_modules/dep/index.js", Some("module.exports = 1")),
			],
		);
	}

	pub(crate) fn write_zip(path: &Path, entries: &[(&str, Option<&str>)]) {
		let file = File::create(path).unwrap();
		let mut zip = zip::ZipWriter::new(file);
		for (name, contents) in entries {
			match contents {
				Some(body) => {
					zip.start_file(*name, zip::write::SimpleFileOptions::default()).unwrap();
					zip.write_all(body.as_bytes()).unwrap();
				}
				None => zip.add_directory(*name, zip::write::SimpleFileOptions::default()).unwrap(),
			}
		}
		zip.finish().unwrap();
	}

	#[test]
	fn test_safe_entry_path() {
		let dest = Path::new("/opt/runtime");
		assert_eq!(
			safe_entry_path(dest, "bridge/index.js").unwrap(),
			PathBuf::from("/opt/runtime/bridge/index.js")
		);
		assert_eq!(
			safe_entry_path(dest, "./bridge/a").unwrap(),
			PathBuf::from("/opt/runtime/bridge/a")
		);
		assert!(safe_entry_path(dest, "../etc/passwd").is_err());
		assert!(safe_entry_path(dest, "bridge/../../x").is_err());
		assert!(safe_entry_path(dest, "/etc/passwd").is_err());
		assert!(safe_entry_path(dest, "a\0b").is_err());
		assert!(safe_entry_path(dest, ".").is_err());
	}

	#[test]
	fn test_zip_extract_produces_valid_tree() {
		let tmp = tempfile::tempdir().unwrap();
		let archive = tmp.path().join("bridge.zip");
		write_bundle(&archive);
		let source = BundleSource::new(&archive, "1.0.0", tmp.path().join("install"));
		let target = source.target_dir();

		ZipExtractor.extract(&source, &target, "1.0.0:abc").unwrap();
		assert!(target.join(ENTRY_SCRIPT).is_file());
		assert!(target.join(DEPENDENCY_DIR).join("dep/index.js").is_file());
		assert!(is_valid_runtime_dir(&target, "1.0.0:abc"));
		assert!(!tmp.path().join("install/.bridge-1.0.0.staging").exists());
	}

	/// **Test: Path traversal entries abort extraction**
	///
	/// A hostile archive must not write outside the install root, and the
	/// failed attempt must not leave a target directory behind.
	#[test]
	fn test_zip_slip_rejected() {
		let tmp = tempfile::tempdir().unwrap();
		let archive = tmp.path().join("evil.zip");
		write_zip(&archive, &[("../escaped.txt", Some("gotcha"))]);
		let source = BundleSource::new(&archive, "1", tmp.path().join("install"));
		let target = source.target_dir();

		let err = ZipExtractor.extract(&source, &target, "1:x").unwrap_err();
		assert!(matches!(err, GateError::InvalidBundle(_)));
		assert!(!tmp.path().join("escaped.txt").exists());
		assert!(!target.exists());
	}

	#[test]
	fn test_corrupt_archive_is_archive_error() {
		let tmp = tempfile::tempdir().unwrap();
		let archive = tmp.path().join("corrupt.zip");
		std::fs::write(&archive, b"not a zip").unwrap();
		let source = BundleSource::new(&archive, "1", tmp.path().join("install"));

		let err = ZipExtractor.extract(&source, &source.target_dir(), "1:x").unwrap_err();
		assert!(matches!(err, GateError::Archive { .. }));
	}
}
