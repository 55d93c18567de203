// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Prompt, decision, and outcome types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the agent is asking for. Each kind has its own deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
	/// Approval to run one tool call.
	ToolUse,
	/// Multi-field question the user answers.
	Question,
	/// Approval of a proposed plan before execution.
	PlanApproval,
}

impl PromptKind {
	pub fn default_timeout(&self) -> Duration {
		match self {
			PromptKind::ToolUse => Duration::from_secs(35),
			PromptKind::Question => Duration::from_secs(60),
			PromptKind::PlanApproval => Duration::from_secs(300),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionPrompt {
	pub kind: PromptKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_name: Option<String>,
	#[serde(default)]
	pub input: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
	pub requested_at: DateTime<Utc>,
}

impl PermissionPrompt {
	pub fn tool_use(tool_name: impl Into<String>, input: Value) -> Self {
		Self {
			kind: PromptKind::ToolUse,
			tool_name: Some(tool_name.into()),
			input,
			message: None,
			requested_at: Utc::now(),
		}
	}

	pub fn question(input: Value) -> Self {
		Self {
			kind: PromptKind::Question,
			tool_name: None,
			input,
			message: None,
			requested_at: Utc::now(),
		}
	}

	pub fn plan_approval(plan: impl Into<String>) -> Self {
		Self {
			kind: PromptKind::PlanApproval,
			tool_name: None,
			input: Value::Null,
			message: Some(plan.into()),
			requested_at: Utc::now(),
		}
	}
}

/// A prompt paired with the channel id the decision must come back on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
	pub channel_id: String,
	pub prompt: PermissionPrompt,
}

/// A user's answer to a prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionDecision {
	pub allow: bool,
	/// Escalates an allow to allow-always for the prompt's tool.
	#[serde(default)]
	pub remember: bool,
	/// Rejection message surfaced back to the agent.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub answers: Option<Value>,
}

impl PermissionDecision {
	pub fn allow() -> Self {
		Self {
			allow: true,
			..Default::default()
		}
	}

	pub fn allow_always() -> Self {
		Self {
			allow: true,
			remember: true,
			..Default::default()
		}
	}

	pub fn deny(message: impl Into<String>) -> Self {
		Self {
			allow: false,
			message: Some(message.into()),
			..Default::default()
		}
	}

	pub fn answer(answers: Value) -> Self {
		Self {
			allow: true,
			answers: Some(answers),
			..Default::default()
		}
	}
}

/// How a channel was finally resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PermissionOutcome {
	Allow,
	AllowAlways,
	Deny { message: Option<String> },
	Answered { answers: Value },
	/// No decision arrived before the deadline. Reported as a denial.
	TimedOut,
}

impl PermissionOutcome {
	pub fn is_allowed(&self) -> bool {
		matches!(
			self,
			PermissionOutcome::Allow | PermissionOutcome::AllowAlways | PermissionOutcome::Answered { .. }
		)
	}

	/// The behaviour string an agent expects back.
	pub fn behavior(&self) -> &'static str {
		if self.is_allowed() {
			"allow"
		} else {
			"deny"
		}
	}

	pub fn message(&self) -> Option<&str> {
		match self {
			PermissionOutcome::Deny { message } => message.as_deref(),
			PermissionOutcome::TimedOut => Some("Permission request timed out"),
			_ => None,
		}
	}

	pub(crate) fn from_decision(decision: PermissionDecision) -> Self {
		match decision {
			PermissionDecision {
				allow: false,
				message,
				..
			} => PermissionOutcome::Deny { message },
			PermissionDecision {
				answers: Some(answers),
				..
			} => PermissionOutcome::Answered { answers },
			PermissionDecision { remember: true, .. } => PermissionOutcome::AllowAlways,
			PermissionDecision { .. } => PermissionOutcome::Allow,
		}
	}
}
