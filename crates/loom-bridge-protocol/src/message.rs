// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Structured `[MESSAGE]` payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message types that only report progress and never enter the transcript.
const STATUS_TYPES: &[&str] = &["status", "progress", "keep_alive", "heartbeat"];

/// `system` subtypes that are status-only.
const STATUS_SUBTYPES: &[&str] = &["status", "compacting"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub subtype: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<MessageBody>,
	/// Everything else the agent sent, preserved for the caller.
	#[serde(flatten)]
	pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub role: Option<String>,
	#[serde(default)]
	pub content: MessageContent,
}

/// Message content is either a bare string or a list of typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
	Text(String),
	Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
	fn default() -> Self {
		MessageContent::Blocks(Vec::new())
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
	Text {
		text: String,
	},
	Thinking {
		thinking: String,
	},
	ToolUse {
		id: String,
		name: String,
		#[serde(default)]
		input: Value,
	},
	ToolResult {
		tool_use_id: String,
		#[serde(default)]
		content: Value,
		#[serde(default)]
		is_error: bool,
	},
	#[serde(other)]
	Unknown,
}

impl AgentMessage {
	pub fn role(&self) -> Option<&str> {
		self.message.as_ref().and_then(|m| m.role.as_deref())
	}

	pub fn is_assistant(&self) -> bool {
		self.kind == "assistant" || self.role() == Some("assistant")
	}

	/// Whether this message is progress chatter rather than conversation.
	pub fn is_status(&self) -> bool {
		if STATUS_TYPES.contains(&self.kind.as_str()) {
			return true;
		}
		self.kind == "system"
			&& self
				.subtype
				.as_deref()
				.is_some_and(|s| STATUS_SUBTYPES.contains(&s))
	}

	/// Human-readable text for a status message.
	pub fn status_text(&self) -> String {
		["text", "message", "status"]
			.iter()
			.find_map(|key| self.extra.get(*key).and_then(Value::as_str))
			.map(str::to_string)
			.or_else(|| self.subtype.clone())
			.unwrap_or_else(|| self.kind.clone())
	}

	/// Concatenated text blocks of the message body.
	pub fn text(&self) -> String {
		match self.message.as_ref().map(|m| &m.content) {
			Some(MessageContent::Text(text)) => text.clone(),
			Some(MessageContent::Blocks(blocks)) => blocks
				.iter()
				.filter_map(|block| match block {
					ContentBlock::Text { text } => Some(text.as_str()),
					_ => None,
				})
				.collect::<Vec<_>>()
				.join(""),
			None => String::new(),
		}
	}

	/// Content blocks in order; a bare string body becomes one text block.
	pub fn blocks(&self) -> Vec<ContentBlock> {
		match self.message.as_ref().map(|m| &m.content) {
			Some(MessageContent::Text(text)) => vec![ContentBlock::Text { text: text.clone() }],
			Some(MessageContent::Blocks(blocks)) => blocks.clone(),
			None => Vec::new(),
		}
	}
}
