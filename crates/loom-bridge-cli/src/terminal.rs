// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Permission prompts on the terminal.
//!
//! The surface only queues requests; the chat loop owns stdin and turns the
//! next line typed while a prompt is pending into its decision.

use async_trait::async_trait;
use loom_bridge::PermissionDecision;
use loom_bridge_permission::{PermissionRequest, PromptKind, PromptSurface, SurfaceError};
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub struct TerminalSurface {
	tx: mpsc::UnboundedSender<PermissionRequest>,
}

impl TerminalSurface {
	pub fn new() -> (Self, mpsc::UnboundedReceiver<PermissionRequest>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { tx }, rx)
	}
}

#[async_trait]
impl PromptSurface for TerminalSurface {
	async fn show_prompt(&self, request: &PermissionRequest) -> Result<(), SurfaceError> {
		self
			.tx
			.send(request.clone())
			.map_err(|_| SurfaceError::Closed("terminal input closed".to_string()))
	}
}

/// One-line description plus the accepted answers.
pub fn describe(request: &PermissionRequest) -> String {
	let prompt = &request.prompt;
	match prompt.kind {
		PromptKind::ToolUse => {
			let tool = prompt.tool_name.as_deref().unwrap_or("tool");
			format!("allow {tool} {}? [y]es / [a]lways / [n]o", compact(&prompt.input))
		}
		PromptKind::Question => format!("{} (type an answer, empty to skip)", question_text(&prompt.input)),
		PromptKind::PlanApproval => {
			let plan = prompt.message.as_deref().unwrap_or_default();
			format!("{plan}\napprove plan? [y]es / [n]o")
		}
	}
}

/// Decision for a typed line, or `None` when the line is not an answer.
pub fn parse_answer(request: &PermissionRequest, line: &str) -> Option<PermissionDecision> {
	let line = line.trim();
	match request.prompt.kind {
		PromptKind::Question => {
			if line.is_empty() {
				return Some(PermissionDecision::deny("User skipped the question"));
			}
			let question = question_text(&request.prompt.input);
			Some(PermissionDecision::answer(json!({ question: line })))
		}
		PromptKind::ToolUse | PromptKind::PlanApproval => match line.to_ascii_lowercase().as_str() {
			"y" | "yes" => Some(PermissionDecision::allow()),
			"a" | "always" if request.prompt.kind == PromptKind::ToolUse => Some(PermissionDecision::allow_always()),
			"n" | "no" => Some(PermissionDecision::deny("User denied")),
			_ => None,
		},
	}
}

fn question_text(input: &Value) -> String {
	input
		.pointer("/questions/0/question")
		.and_then(Value::as_str)
		.unwrap_or("answer")
		.to_string()
}

fn compact(input: &Value) -> String {
	let mut text = input.to_string();
	if text.len() > 120 {
		let cut = (0..=117).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
		text.truncate(cut);
		text.push_str("...");
	}
	text
}
