// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Persisted per-user session preferences.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use loom_bridge_protocol::PermissionMode;
use tracing::warn;

use crate::config::ConfigError;
use crate::provider::ProviderKind;

pub const KEY_PERMISSION_MODE: &str = "permission_mode";
pub const KEY_MODEL: &str = "model";
pub const KEY_WORKING_DIRECTORY: &str = "working_directory";
pub const KEY_REASONING_EFFORT: &str = "reasoning_effort";

/// Key/value preference storage.
pub trait SettingsStore: Send + Sync {
	fn get(&self, key: &str) -> Option<String>;
	fn set(&self, key: &str, value: &str) -> Result<(), ConfigError>;
	fn remove(&self, key: &str) -> Result<(), ConfigError>;
}

#[derive(Debug, Default)]
pub struct MemorySettings {
	values: Mutex<HashMap<String, String>>,
}

impl SettingsStore for MemorySettings {
	fn get(&self, key: &str) -> Option<String> {
		self.values
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.get(key)
			.cloned()
	}

	fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
		self.values
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(key.to_string(), value.to_string());
		Ok(())
	}

	fn remove(&self, key: &str) -> Result<(), ConfigError> {
		self.values
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(key);
		Ok(())
	}
}

/// A flat TOML table on disk, rewritten atomically on every change.
#[derive(Debug)]
pub struct TomlSettingsStore {
	path: PathBuf,
	values: Mutex<BTreeMap<String, String>>,
}

impl TomlSettingsStore {
	pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
		let path = path.into();
		let values = if path.exists() {
			let raw = std::fs::read_to_string(&path)?;
			toml::from_str(&raw).map_err(|source| ConfigError::TomlParse {
				path: path.clone(),
				source,
			})?
		} else {
			BTreeMap::new()
		};
		Ok(Self {
			path,
			values: Mutex::new(values),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn persist(&self, values: &BTreeMap<String, String>) -> Result<(), ConfigError> {
		if let Some(parent) = self.path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let encoded = toml::to_string(values)?;
		let tmp = self.path.with_extension("toml.tmp");
		std::fs::write(&tmp, encoded)?;
		std::fs::rename(&tmp, &self.path)?;
		Ok(())
	}
}

impl SettingsStore for TomlSettingsStore {
	fn get(&self, key: &str) -> Option<String> {
		self.values
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.get(key)
			.cloned()
	}

	fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
		let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
		values.insert(key.to_string(), value.to_string());
		self.persist(&values)
	}

	fn remove(&self, key: &str) -> Result<(), ConfigError> {
		let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
		if values.remove(key).is_some() {
			self.persist(&values)?;
		}
		Ok(())
	}
}

/// Per-session options that shape every turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
	pub permission_mode: PermissionMode,
	pub model: String,
	/// `None` runs turns in the runtime directory.
	pub working_directory: Option<PathBuf>,
	pub reasoning_effort: Option<String>,
	pub system_prompt: Option<String>,
}

impl SessionSettings {
	pub fn for_provider(provider: ProviderKind) -> Self {
		Self {
			permission_mode: PermissionMode::Default,
			model: provider.default_model().to_string(),
			working_directory: None,
			reasoning_effort: None,
			system_prompt: None,
		}
	}

	/// Read stored preferences, falling back to provider defaults. An
	/// unreadable permission mode is ignored rather than failing the session.
	pub fn load(store: &dyn SettingsStore, provider: ProviderKind) -> Self {
		let mut settings = Self::for_provider(provider);
		if let Some(raw) = store.get(KEY_PERMISSION_MODE) {
			match raw.parse() {
				Ok(mode) => settings.permission_mode = mode,
				Err(e) => warn!(value = %raw, error = %e, "ignoring stored permission mode"),
			}
		}
		if let Some(model) = store.get(KEY_MODEL).filter(|m| !m.is_empty()) {
			settings.model = model;
		}
		settings.working_directory = store
			.get(KEY_WORKING_DIRECTORY)
			.filter(|d| !d.is_empty())
			.map(PathBuf::from);
		settings.reasoning_effort = store.get(KEY_REASONING_EFFORT).filter(|r| !r.is_empty());
		settings
	}

	pub fn save(&self, store: &dyn SettingsStore) -> Result<(), ConfigError> {
		store.set(KEY_PERMISSION_MODE, self.permission_mode.as_str())?;
		store.set(KEY_MODEL, &self.model)?;
		match &self.working_directory {
			Some(dir) => store.set(KEY_WORKING_DIRECTORY, &dir.to_string_lossy())?,
			None => store.remove(KEY_WORKING_DIRECTORY)?,
		}
		match &self.reasoning_effort {
			Some(effort) => store.set(KEY_REASONING_EFFORT, effort)?,
			None => store.remove(KEY_REASONING_EFFORT)?,
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_defaults_per_provider() {
		let store = MemorySettings::default();
		let settings = SessionSettings::load(&store, ProviderKind::Codex);
		assert_eq!(settings.permission_mode, PermissionMode::Default);
		assert_eq!(settings.model, "gpt-5-codex");
		assert!(settings.working_directory.is_none());
	}

	#[test]
	fn test_bad_permission_mode_is_ignored() {
		let store = MemorySettings::default();
		store.set(KEY_PERMISSION_MODE, "yolo").unwrap();
		store.set(KEY_MODEL, "opus").unwrap();

		let settings = SessionSettings::load(&store, ProviderKind::Claude);
		assert_eq!(settings.permission_mode, PermissionMode::Default);
		assert_eq!(settings.model, "opus");
	}

	/// **Test: TOML store survives a reopen**
	///
	/// Settings are written through a temp file and rename, so a reopened
	/// store sees exactly what was saved and no temp file is left behind.
	#[test]
	fn test_toml_store_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("nested/settings.toml");

		let settings = SessionSettings {
			permission_mode: PermissionMode::Plan,
			model: "opus".to_string(),
			working_directory: Some(PathBuf::from("/work/repo")),
			reasoning_effort: Some("high".to_string()),
			system_prompt: None,
		};
		{
			let store = TomlSettingsStore::open(&path).unwrap();
			settings.save(&store).unwrap();
		}

		let reopened = TomlSettingsStore::open(&path).unwrap();
		assert_eq!(SessionSettings::load(&reopened, ProviderKind::Claude), settings);
		assert!(!path.with_extension("toml.tmp").exists());
	}

	#[test]
	fn test_clearing_working_directory_removes_key() {
		let store = MemorySettings::default();
		store.set(KEY_WORKING_DIRECTORY, "/old").unwrap();

		SessionSettings::for_provider(ProviderKind::Claude)
			.save(&store)
			.unwrap();
		assert!(store.get(KEY_WORKING_DIRECTORY).is_none());
	}
}
