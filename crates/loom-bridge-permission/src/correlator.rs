// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Pending-approval correlation.
//!
//! Every approval request gets a fresh channel id and a single-resolution
//! slot in the pending map. Whoever removes the slot from the map completes
//! it: an explicit [`PermissionCorrelator::resolve`], the kind's deadline
//! timer, or a presentation failure. Removal happens under the map's lock, so
//! at most one of them can ever win and the rest are silent no-ops.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::SurfaceError;
use crate::prompt::{PermissionDecision, PermissionOutcome, PermissionPrompt, PermissionRequest, PromptKind};
use crate::surface::PromptSurface;

/// Deadlines and presentation retry schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatorConfig {
	pub tool_use_timeout: Duration,
	pub question_timeout: Duration,
	pub plan_approval_timeout: Duration,
	/// Delay before each retry when the surface reports `NotReady`. The
	/// length is the retry bound.
	pub surface_retry_delays: Vec<Duration>,
}

impl Default for CorrelatorConfig {
	fn default() -> Self {
		Self {
			tool_use_timeout: PromptKind::ToolUse.default_timeout(),
			question_timeout: PromptKind::Question.default_timeout(),
			plan_approval_timeout: PromptKind::PlanApproval.default_timeout(),
			surface_retry_delays: [100, 200, 500, 1000, 2000]
				.into_iter()
				.map(Duration::from_millis)
				.collect(),
		}
	}
}

impl CorrelatorConfig {
	pub fn timeout_for(&self, kind: PromptKind) -> Duration {
		match kind {
			PromptKind::ToolUse => self.tool_use_timeout,
			PromptKind::Question => self.question_timeout,
			PromptKind::PlanApproval => self.plan_approval_timeout,
		}
	}
}

/// Handle to one outstanding request.
#[derive(Debug)]
pub struct PendingApproval {
	pub channel_id: String,
	receiver: oneshot::Receiver<PermissionOutcome>,
}

impl PendingApproval {
	/// Wait for whichever of decision, deadline, or presentation failure
	/// happens first.
	pub async fn outcome(self) -> PermissionOutcome {
		self.receiver.await.unwrap_or(PermissionOutcome::Deny {
			message: Some("Permission channel closed".to_string()),
		})
	}
}

struct PendingSlot {
	sender: oneshot::Sender<PermissionOutcome>,
	tool_name: Option<String>,
	scope: Option<String>,
	deadline: Option<JoinHandle<()>>,
}

struct Inner {
	pending: Mutex<HashMap<String, PendingSlot>>,
	remembered: Mutex<HashSet<String>>,
	surface: Arc<dyn PromptSurface>,
	config: CorrelatorConfig,
}

/// Maps outbound approval prompts to pending decisions.
///
/// Cheap to clone; clones share the pending map.
#[derive(Clone)]
pub struct PermissionCorrelator {
	inner: Arc<Inner>,
}

impl std::fmt::Debug for PermissionCorrelator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PermissionCorrelator")
			.field("pending", &self.pending_count())
			.field("config", &self.inner.config)
			.finish()
	}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PermissionCorrelator {
	pub fn new(surface: Arc<dyn PromptSurface>) -> Self {
		Self::with_config(surface, CorrelatorConfig::default())
	}

	pub fn with_config(surface: Arc<dyn PromptSurface>, config: CorrelatorConfig) -> Self {
		Self {
			inner: Arc::new(Inner {
				pending: Mutex::new(HashMap::new()),
				remembered: Mutex::new(HashSet::new()),
				surface,
				config,
			}),
		}
	}

	pub fn config(&self) -> &CorrelatorConfig {
		&self.inner.config
	}

	/// Register a prompt, show it, and arm its deadline.
	///
	/// Must be called from within a tokio runtime. Tool-use prompts for a
	/// tool the user already chose to always allow resolve immediately
	/// without being shown.
	pub fn request_approval(&self, prompt: PermissionPrompt) -> PendingApproval {
		self.register(prompt, None)
	}

	/// [`Self::request_approval`] tagged with `scope`, so that
	/// [`Self::cancel_scope`] can deny it when its owner goes away.
	pub fn request_approval_in(&self, scope: &str, prompt: PermissionPrompt) -> PendingApproval {
		self.register(prompt, Some(scope.to_string()))
	}

	#[instrument(skip(self, prompt), fields(kind = ?prompt.kind, tool = ?prompt.tool_name, scope = ?scope))]
	fn register(&self, prompt: PermissionPrompt, scope: Option<String>) -> PendingApproval {
		let channel_id = Uuid::new_v4().to_string();
		let (sender, receiver) = oneshot::channel();

		if self.is_remembered(&prompt) {
			debug!(channel_id = %channel_id, "tool previously allowed always; skipping prompt");
			let _ = sender.send(PermissionOutcome::AllowAlways);
			return PendingApproval { channel_id, receiver };
		}

		let kind = prompt.kind;
		lock(&self.inner.pending).insert(
			channel_id.clone(),
			PendingSlot {
				sender,
				tool_name: prompt.tool_name.clone(),
				scope,
				deadline: None,
			},
		);

		let timeout = self.inner.config.timeout_for(kind);
		let deadline = tokio::spawn({
			let this = self.clone();
			let channel_id = channel_id.clone();
			async move {
				tokio::time::sleep(timeout).await;
				if this.complete(&channel_id, PermissionOutcome::TimedOut) {
					info!(channel_id = %channel_id, timeout_secs = timeout.as_secs(), "permission request timed out; denying");
				}
			}
		});
		match lock(&self.inner.pending).get_mut(&channel_id) {
			Some(slot) => slot.deadline = Some(deadline),
			None => deadline.abort(),
		}

		tokio::spawn({
			let this = self.clone();
			let request = PermissionRequest {
				channel_id: channel_id.clone(),
				prompt,
			};
			async move { this.present(request).await }
		});

		info!(channel_id = %channel_id, timeout_secs = timeout.as_secs(), "permission requested");
		PendingApproval { channel_id, receiver }
	}

	/// [`Self::request_approval`] and wait for its outcome.
	pub async fn request_approval_and_wait(&self, prompt: PermissionPrompt) -> PermissionOutcome {
		self.request_approval(prompt).outcome().await
	}

	/// Deliver a user decision. Returns `false` if the channel is unknown or
	/// was already resolved, in which case nothing happens.
	pub fn resolve(&self, channel_id: &str, decision: PermissionDecision) -> bool {
		let Some(slot) = self.take(channel_id) else {
			debug!(channel_id = %channel_id, "ignoring decision for unknown or resolved channel");
			return false;
		};

		let outcome = PermissionOutcome::from_decision(decision);
		if outcome == PermissionOutcome::AllowAlways {
			if let Some(tool) = &slot.tool_name {
				info!(channel_id = %channel_id, tool = %tool, "remembering allow-always decision");
				lock(&self.inner.remembered).insert(tool.clone());
			}
		}
		info!(channel_id = %channel_id, behavior = outcome.behavior(), "permission resolved");
		Self::finish(slot, outcome);
		true
	}

	/// Deny every outstanding request registered under `scope`, e.g. when
	/// the session that raised them is closed. Other scopes are untouched.
	pub fn cancel_scope(&self, scope: &str, message: &str) -> usize {
		let slots: Vec<PendingSlot> = {
			let mut pending = lock(&self.inner.pending);
			let ids: Vec<String> = pending
				.iter()
				.filter(|(_, slot)| slot.scope.as_deref() == Some(scope))
				.map(|(id, _)| id.clone())
				.collect();
			ids.iter().filter_map(|id| pending.remove(id)).collect()
		};
		let count = slots.len();
		for slot in slots {
			Self::finish(
				slot,
				PermissionOutcome::Deny {
					message: Some(message.to_string()),
				},
			);
		}
		if count > 0 {
			info!(scope = %scope, count, "cancelled outstanding permission requests");
		}
		count
	}

	pub fn is_pending(&self, channel_id: &str) -> bool {
		lock(&self.inner.pending).contains_key(channel_id)
	}

	pub fn pending_count(&self) -> usize {
		lock(&self.inner.pending).len()
	}

	pub fn remembered_tools(&self) -> Vec<String> {
		let mut tools: Vec<String> = lock(&self.inner.remembered).iter().cloned().collect();
		tools.sort();
		tools
	}

	pub fn forget_remembered(&self) {
		lock(&self.inner.remembered).clear();
	}

	fn is_remembered(&self, prompt: &PermissionPrompt) -> bool {
		prompt.kind == PromptKind::ToolUse
			&& prompt
				.tool_name
				.as_ref()
				.is_some_and(|tool| lock(&self.inner.remembered).contains(tool))
	}

	fn take(&self, channel_id: &str) -> Option<PendingSlot> {
		lock(&self.inner.pending).remove(channel_id)
	}

	fn complete(&self, channel_id: &str, outcome: PermissionOutcome) -> bool {
		match self.take(channel_id) {
			Some(slot) => {
				Self::finish(slot, outcome);
				true
			}
			None => false,
		}
	}

	fn finish(slot: PendingSlot, outcome: PermissionOutcome) {
		if let Some(deadline) = slot.deadline {
			deadline.abort();
		}
		// A dropped receiver means nobody is waiting any more.
		let _ = slot.sender.send(outcome);
	}

	async fn present(&self, request: PermissionRequest) {
		let delays = &self.inner.config.surface_retry_delays;
		let mut attempt = 0usize;
		loop {
			if !self.is_pending(&request.channel_id) {
				return;
			}
			match self.inner.surface.show_prompt(&request).await {
				Ok(()) => return,
				Err(SurfaceError::NotReady) if attempt < delays.len() => {
					debug!(channel_id = %request.channel_id, attempt, "surface not ready; retrying");
					tokio::time::sleep(delays[attempt]).await;
					attempt += 1;
				}
				Err(e) => {
					warn!(channel_id = %request.channel_id, error = %e, attempts = attempt + 1, "could not show permission prompt; denying");
					self.complete(
						&request.channel_id,
						PermissionOutcome::Deny {
							message: Some(format!("Permission prompt could not be shown: {e}")),
						},
					);
					return;
				}
			}
		}
	}
}
