// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Protocol error types.

/// Errors raised while interpreting a tagged payload or building stdin input.
///
/// The line decoder never returns these to its caller: a bad payload is
/// logged and downgraded to a diagnostic so the turn keeps going.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
	/// Tagged payload was expected to be JSON but was not
	#[error("malformed {tag} payload: {source}")]
	MalformedJson {
		tag: &'static str,
		#[source]
		source: serde_json::Error,
	},

	/// Tag requires a payload but none was present
	#[error("empty {0} payload")]
	EmptyPayload(&'static str),

	/// Unknown permission mode name
	#[error("unknown permission mode: {0}")]
	UnknownPermissionMode(String),

	/// Turn input could not be serialized
	#[error("failed to serialize turn input: {0}")]
	Serialize(#[from] serde_json::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
