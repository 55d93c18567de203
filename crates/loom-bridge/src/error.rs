// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Error types for the session bridge.

use std::path::PathBuf;

use loom_bridge_runtime::GateError;

use crate::config::ConfigError;

/// Failures that stop a turn before any process is registered.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
	#[error("executable not found: {name}")]
	ExecutableNotFound { name: String },

	#[error("bridge runtime is not ready")]
	RuntimeNotReady,

	#[error("bridge command is empty")]
	EmptyCommand,

	#[error("failed to spawn {program}: {source}")]
	Spawn {
		program: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to write turn input: {0}")]
	Stdin(#[source] std::io::Error),

	#[error("failed to prepare turn directory {path}: {source}")]
	TempDir {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to encode turn input: {0}")]
	Serialize(#[from] loom_bridge_protocol::ProtocolError),
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
	#[error("launch failed: {0}")]
	Launch(#[from] LaunchError),

	#[error("a turn is already in progress for session {session_id}")]
	TurnInProgress { session_id: String },

	#[error("session not found: {0}")]
	SessionNotFound(String),

	#[error("{provider} does not accept attachments")]
	UnsupportedAttachments { provider: &'static str },

	#[error("environment setup failed: {0}")]
	Runtime(#[from] GateError),

	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("internal error: {0}")]
	Internal(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
