// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Bridge configuration.
//!
//! Values come from three layers, later ones winning: built-in defaults,
//! `$XDG_CONFIG_HOME/loom/bridge.toml`, then `LOOM_BRIDGE_*` environment
//! variables. The CLI applies its flags on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use loom_bridge_permission::CorrelatorConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("TOML parse error in {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("TOML encode error: {0}")]
	TomlEncode(#[from] toml::ser::Error),

	#[error("Invalid value for {field}: {message}")]
	InvalidValue { field: String, message: String },

	#[error("Could not determine home directory")]
	HomeDirNotFound,
}

impl ConfigError {
	pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
		Self::InvalidValue {
			field: field.into(),
			message: message.into(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionTimeouts {
	pub tool_use_secs: u64,
	pub question_secs: u64,
	pub plan_approval_secs: u64,
}

impl Default for PermissionTimeouts {
	fn default() -> Self {
		Self {
			tool_use_secs: 35,
			question_secs: 60,
			plan_approval_secs: 300,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
	/// Node binary used to run the bridge script.
	pub node_path: String,
	/// Replaces `node <runtime>/bridge/index.js` entirely when set.
	pub bridge_command: Option<Vec<String>>,
	/// A pre-installed runtime tree; skips bundle extraction.
	pub runtime_dir: Option<PathBuf>,
	pub bundle_archive: Option<PathBuf>,
	pub bundle_version: String,
	pub install_root: Option<PathBuf>,
	pub temp_root: Option<PathBuf>,
	pub permission_root: Option<PathBuf>,
	pub extra_path_dirs: Vec<PathBuf>,
	/// Ask a login shell for credentials missing from the environment.
	pub probe_login_shell: bool,
	pub permissions: PermissionTimeouts,
	pub throttle_ms: u64,
}

impl Default for BridgeConfig {
	fn default() -> Self {
		Self {
			node_path: "node".to_string(),
			bridge_command: None,
			runtime_dir: None,
			bundle_archive: None,
			bundle_version: "0".to_string(),
			install_root: None,
			temp_root: None,
			permission_root: None,
			extra_path_dirs: Vec::new(),
			probe_login_shell: true,
			permissions: PermissionTimeouts::default(),
			throttle_ms: 50,
		}
	}
}

/// `$XDG_CONFIG_HOME/loom/bridge.toml`, falling back to `~/.config`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
	let config_home = match std::env::var_os("XDG_CONFIG_HOME") {
		Some(dir) => PathBuf::from(dir),
		None => dirs::home_dir()
			.ok_or(ConfigError::HomeDirNotFound)?
			.join(".config"),
	};
	Ok(config_home.join("loom/bridge.toml"))
}

impl BridgeConfig {
	/// Load from `path` (or the default location) and apply the process
	/// environment. A missing file yields defaults.
	pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
		let path = match path {
			Some(path) => path.to_path_buf(),
			None => default_config_path()?,
		};
		let mut config = Self::from_file(&path)?;
		config.apply_env(std::env::vars())?;
		Ok(config)
	}

	pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
		if !path.exists() {
			debug!(path = %path.display(), "no bridge config file, using defaults");
			return Ok(Self::default());
		}
		let raw = std::fs::read_to_string(path)?;
		toml::from_str(&raw).map_err(|source| ConfigError::TomlParse {
			path: path.to_path_buf(),
			source,
		})
	}

	pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
	where
		I: IntoIterator<Item = (String, String)>,
	{
		for (key, value) in vars {
			let Some(field) = key.strip_prefix("LOOM_BRIDGE_") else {
				continue;
			};
			match field {
				"NODE_PATH" => self.node_path = value,
				"RUNTIME_DIR" => self.runtime_dir = Some(PathBuf::from(value)),
				"BUNDLE_ARCHIVE" => self.bundle_archive = Some(PathBuf::from(value)),
				"BUNDLE_VERSION" => self.bundle_version = value,
				"INSTALL_ROOT" => self.install_root = Some(PathBuf::from(value)),
				"TEMP_ROOT" => self.temp_root = Some(PathBuf::from(value)),
				"PERMISSION_ROOT" => self.permission_root = Some(PathBuf::from(value)),
				"PROBE_LOGIN_SHELL" => self.probe_login_shell = parse_bool(&key, &value)?,
				"THROTTLE_MS" => {
					self.throttle_ms = value
						.parse()
						.map_err(|_| ConfigError::invalid_value(&key, "expected milliseconds"))?;
				}
				_ => {}
			}
		}
		Ok(())
	}

	pub fn temp_root(&self) -> PathBuf {
		self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
	}

	pub fn permission_root(&self) -> PathBuf {
		self
			.permission_root
			.clone()
			.unwrap_or_else(|| self.temp_root().join("loom-bridge-permissions"))
	}

	pub fn install_root(&self) -> Result<PathBuf, ConfigError> {
		if let Some(root) = &self.install_root {
			return Ok(root.clone());
		}
		let data_home = match std::env::var_os("XDG_DATA_HOME") {
			Some(dir) => PathBuf::from(dir),
			None => dirs::home_dir()
				.ok_or(ConfigError::HomeDirNotFound)?
				.join(".local/share"),
		};
		Ok(data_home.join("loom/bridge"))
	}

	pub fn throttle_interval(&self) -> Duration {
		Duration::from_millis(self.throttle_ms)
	}

	pub fn correlator_config(&self) -> CorrelatorConfig {
		CorrelatorConfig {
			tool_use_timeout: Duration::from_secs(self.permissions.tool_use_secs),
			question_timeout: Duration::from_secs(self.permissions.question_secs),
			plan_approval_timeout: Duration::from_secs(self.permissions.plan_approval_secs),
			..CorrelatorConfig::default()
		}
	}
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
	match value.to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		_ => Err(ConfigError::invalid_value(key, "expected a boolean")),
	}
}
