// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! The stdin document handed to an agent process for one turn.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// How much the agent may do without asking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
	#[default]
	Default,
	AcceptEdits,
	Plan,
	BypassPermissions,
}

impl PermissionMode {
	pub fn as_str(&self) -> &'static str {
		match self {
			PermissionMode::Default => "default",
			PermissionMode::AcceptEdits => "acceptEdits",
			PermissionMode::Plan => "plan",
			PermissionMode::BypassPermissions => "bypassPermissions",
		}
	}
}

impl fmt::Display for PermissionMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for PermissionMode {
	type Err = ProtocolError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"default" => Ok(PermissionMode::Default),
			"acceptEdits" | "accept-edits" => Ok(PermissionMode::AcceptEdits),
			"plan" => Ok(PermissionMode::Plan),
			"bypassPermissions" | "bypass-permissions" => Ok(PermissionMode::BypassPermissions),
			other => Err(ProtocolError::UnknownPermissionMode(other.to_string())),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPayload {
	pub media_type: String,
	/// Standard base64.
	pub data: String,
}

impl AttachmentPayload {
	pub fn from_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
		Self {
			media_type: media_type.into(),
			data: STANDARD.encode(bytes),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnInput {
	pub message: String,
	/// Provider thread/session id; empty for a new conversation.
	#[serde(default)]
	pub session_id: String,
	pub cwd: PathBuf,
	pub permission_mode: PermissionMode,
	pub model: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reasoning_effort: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub system_prompt: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub attachments: Vec<AttachmentPayload>,
	pub channel_id: String,
}

impl TurnInput {
	pub fn to_json(&self) -> ProtocolResult<String> {
		Ok(serde_json::to_string(self)?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_permission_mode_names() {
		for mode in [
			PermissionMode::Default,
			PermissionMode::AcceptEdits,
			PermissionMode::Plan,
			PermissionMode::BypassPermissions,
		] {
			assert_eq!(mode.as_str().parse::<PermissionMode>().unwrap(), mode);
			assert_eq!(
				serde_json::to_value(mode).unwrap(),
				serde_json::Value::from(mode.as_str())
			);
		}
		assert!("yolo".parse::<PermissionMode>().is_err());
	}

	/// **Test: The stdin document uses the camelCase wire names**
	///
	/// Bridge scripts read these keys directly. Optional extras are omitted
	/// rather than sent as null so older bridges keep working.
	#[test]
	fn test_turn_input_wire_shape() {
		let input = TurnInput {
			message: "list files".to_string(),
			session_id: String::new(),
			cwd: PathBuf::from("/work"),
			permission_mode: PermissionMode::BypassPermissions,
			model: "gpt-5".to_string(),
			reasoning_effort: Some("high".to_string()),
			system_prompt: None,
			attachments: vec![AttachmentPayload::from_bytes("image/png", b"\x89PNG")],
			channel_id: "c1".to_string(),
		};
		let value: serde_json::Value = serde_json::from_str(&input.to_json().unwrap()).unwrap();
		assert_eq!(value["message"], "list files");
		assert_eq!(value["sessionId"], "");
		assert_eq!(value["cwd"], "/work");
		assert_eq!(value["permissionMode"], "bypassPermissions");
		assert_eq!(value["reasoningEffort"], "high");
		assert_eq!(value["attachments"][0]["mediaType"], "image/png");
		assert_eq!(value["attachments"][0]["data"], "iVBORw==");
		assert_eq!(value["channelId"], "c1");
		assert!(value.get("systemPrompt").is_none());
	}
}
