// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! The two agent backends and what each one supports.

use std::fmt;
use std::str::FromStr;

use loom_bridge_protocol::PermissionMode;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
	Claude,
	Codex,
}

/// Feature switches consulted when assembling a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCapabilities {
	/// The provider continues a conversation from a thread id.
	pub session_resume: bool,
	/// Role instructions go in a dedicated system prompt rather than the
	/// user turn.
	pub system_role: bool,
	pub attachments: bool,
}

/// Whether the host platform can run the sandbox the workspace-write mode
/// needs. Windows cannot, so bypass mode falls back to full access there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
	Sandboxed,
	Restricted,
}

impl Platform {
	pub fn current() -> Self {
		if cfg!(windows) {
			Platform::Restricted
		} else {
			Platform::Sandboxed
		}
	}
}

/// Codex sandbox and approval settings derived from a permission mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodexPolicy {
	pub sandbox_mode: &'static str,
	pub approval_policy: &'static str,
}

impl CodexPolicy {
	pub fn for_mode(mode: PermissionMode, platform: Platform) -> Self {
		let (sandbox_mode, approval_policy) = match mode {
			PermissionMode::Default => ("workspace-write", "untrusted"),
			PermissionMode::AcceptEdits => ("workspace-write", "on-failure"),
			PermissionMode::Plan => ("read-only", "never"),
			PermissionMode::BypassPermissions => match platform {
				Platform::Sandboxed => ("workspace-write", "never"),
				Platform::Restricted => ("danger-full-access", "never"),
			},
		};
		Self {
			sandbox_mode,
			approval_policy,
		}
	}
}

impl ProviderKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			ProviderKind::Claude => "claude",
			ProviderKind::Codex => "codex",
		}
	}

	pub fn capabilities(&self) -> ProviderCapabilities {
		match self {
			ProviderKind::Claude => ProviderCapabilities {
				session_resume: true,
				system_role: true,
				attachments: true,
			},
			ProviderKind::Codex => ProviderCapabilities {
				session_resume: false,
				system_role: false,
				attachments: false,
			},
		}
	}

	pub fn default_model(&self) -> &'static str {
		match self {
			ProviderKind::Claude => "sonnet",
			ProviderKind::Codex => "gpt-5-codex",
		}
	}

	/// Provider-specific process variables for a turn.
	pub fn env_vars(&self, mode: PermissionMode, platform: Platform) -> Vec<(&'static str, String)> {
		match self {
			ProviderKind::Claude => vec![("CLAUDE_PERMISSION_MODE", mode.as_str().to_string())],
			ProviderKind::Codex => {
				let policy = CodexPolicy::for_mode(mode, platform);
				vec![
					("CODEX_SANDBOX_MODE", policy.sandbox_mode.to_string()),
					("CODEX_APPROVAL_POLICY", policy.approval_policy.to_string()),
				]
			}
		}
	}
}

impl fmt::Display for ProviderKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ProviderKind {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"claude" => Ok(ProviderKind::Claude),
			"codex" => Ok(ProviderKind::Codex),
			other => Err(ConfigError::invalid_value(
				"provider",
				format!("unknown provider '{other}'"),
			)),
		}
	}
}
