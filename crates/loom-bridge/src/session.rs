// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Sessions and the bridge that runs their turns.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use loom_bridge_permission::{
	PermissionCorrelator, PermissionDecision, PermissionDirectory, PermissionWatcher, PromptSurface,
};
use loom_bridge_protocol::{AttachmentPayload, TurnInput};
use loom_bridge_runtime::{BundleSource, RuntimeGate, RuntimeLocator, StaticRuntime, ZipExtractor};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{BridgeConfig, ConfigError};
use crate::dispatcher::{
	run_turn, ActiveTurn, NullSink, ProcessSlot, TurnJob, TurnLifecycle, TurnResult, TurnSink,
};
use crate::environment::{EnvironmentBuilder, TurnContext};
use crate::error::{BridgeError, BridgeResult, LaunchError};
use crate::launcher::{resolve_working_dir, AgentCommand, LaunchSpec};
use crate::provider::ProviderKind;
use crate::secrets::{SecretResolver, SecretString};
use crate::settings::SessionSettings;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Binary content sent alongside a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
	pub media_type: String,
	pub bytes: Vec<u8>,
}

impl Attachment {
	pub fn new(media_type: impl Into<String>, bytes: Vec<u8>) -> Self {
		Self {
			media_type: media_type.into(),
			bytes,
		}
	}

	/// Read a file, deriving the media type from its extension.
	pub fn from_file(path: &Path) -> std::io::Result<Self> {
		let bytes = std::fs::read(path)?;
		Ok(Self::new(media_type_for(path), bytes))
	}

	fn to_payload(&self) -> AttachmentPayload {
		AttachmentPayload::from_bytes(self.media_type.clone(), &self.bytes)
	}
}

fn media_type_for(path: &Path) -> &'static str {
	let ext = path
		.extension()
		.and_then(|e| e.to_str())
		.map(str::to_ascii_lowercase);
	match ext.as_deref() {
		Some("png") => "image/png",
		Some("jpg" | "jpeg") => "image/jpeg",
		Some("gif") => "image/gif",
		Some("webp") => "image/webp",
		Some("pdf") => "application/pdf",
		_ => "application/octet-stream",
	}
}

/// One entry of a session's history. Failed turns are kept inline with
/// their error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnRecord {
	pub channel_id: String,
	pub prompt: String,
	pub response: Option<String>,
	pub error: Option<String>,
	pub started_at: DateTime<Utc>,
	pub finished_at: DateTime<Utc>,
}

struct SessionInner {
	id: String,
	provider: ProviderKind,
	settings: Mutex<SessionSettings>,
	thread_id: Mutex<Option<String>>,
	records: Mutex<Vec<TurnRecord>>,
	slot: Arc<ProcessSlot>,
	sink: Mutex<Arc<dyn TurnSink>>,
	permissions: PermissionDirectory,
	watcher: Mutex<Option<PermissionWatcher>>,
}

/// A conversation with one agent backend. Cheap to clone.
#[derive(Clone)]
pub struct Session {
	inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("id", &self.inner.id)
			.field("provider", &self.inner.provider)
			.field("busy", &self.is_busy())
			.finish_non_exhaustive()
	}
}

impl Session {
	fn new(provider: ProviderKind, settings: SessionSettings, permission_root: PathBuf) -> Self {
		Self {
			inner: Arc::new(SessionInner {
				id: Uuid::new_v4().to_string(),
				provider,
				settings: Mutex::new(settings),
				thread_id: Mutex::new(None),
				records: Mutex::new(Vec::new()),
				slot: Arc::new(ProcessSlot::new()),
				sink: Mutex::new(Arc::new(NullSink)),
				permissions: PermissionDirectory::new(permission_root),
				watcher: Mutex::new(None),
			}),
		}
	}

	pub fn id(&self) -> &str {
		&self.inner.id
	}

	pub fn provider(&self) -> ProviderKind {
		self.inner.provider
	}

	pub fn settings(&self) -> SessionSettings {
		lock(&self.inner.settings).clone()
	}

	/// Applies from the next turn on.
	pub fn update_settings(&self, update: impl FnOnce(&mut SessionSettings)) {
		update(&mut lock(&self.inner.settings));
	}

	pub fn set_sink(&self, sink: Arc<dyn TurnSink>) {
		*lock(&self.inner.sink) = sink;
	}

	fn sink(&self) -> Arc<dyn TurnSink> {
		Arc::clone(&lock(&self.inner.sink))
	}

	/// Provider conversation id from the most recent turn.
	pub fn thread_id(&self) -> Option<String> {
		lock(&self.inner.thread_id).clone()
	}

	pub fn records(&self) -> Vec<TurnRecord> {
		lock(&self.inner.records).clone()
	}

	pub fn is_busy(&self) -> bool {
		self.inner.slot.active().is_some()
	}

	/// Channel id of the in-flight turn.
	pub fn active_channel(&self) -> Option<String> {
		self.inner.slot.active().map(|t| t.channel_id().to_string())
	}

	/// Whether the in-flight turn has a live process handle.
	pub fn has_process(&self) -> bool {
		self.inner.slot.active().is_some_and(|t| t.has_process())
	}

	pub fn permission_dir(&self) -> Option<PathBuf> {
		self.inner.permissions.path()
	}
}

struct BridgeInner {
	config: BridgeConfig,
	runtime: Arc<dyn RuntimeLocator>,
	gate: Option<RuntimeGate>,
	correlator: PermissionCorrelator,
	environment: EnvironmentBuilder,
	resolver: Option<SecretResolver>,
	secrets: Mutex<Option<BTreeMap<String, SecretString>>>,
	sessions: Mutex<HashMap<String, Session>>,
}

/// Runs turns for any number of sessions, one turn per session at a time.
#[derive(Clone)]
pub struct SessionBridge {
	inner: Arc<BridgeInner>,
}

impl std::fmt::Debug for SessionBridge {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionBridge")
			.field("runtime_ready", &self.inner.runtime.is_ready())
			.field("sessions", &lock(&self.inner.sessions).len())
			.finish_non_exhaustive()
	}
}

impl SessionBridge {
	pub fn new(config: BridgeConfig, runtime: Arc<dyn RuntimeLocator>, surface: Arc<dyn PromptSurface>) -> Self {
		let environment = EnvironmentBuilder::from_process(config.temp_root(), &config.extra_path_dirs);
		let resolver = Some(SecretResolver::from_process(config.probe_login_shell));
		Self::assemble(config, runtime, None, surface, environment, resolver)
	}

	/// Pick the runtime from configuration: an explicit `runtime_dir`, or a
	/// bundle archive extracted on first use.
	pub fn from_config(config: BridgeConfig, surface: Arc<dyn PromptSurface>) -> BridgeResult<Self> {
		if let Some(dir) = &config.runtime_dir {
			let runtime: Arc<dyn RuntimeLocator> = Arc::new(StaticRuntime::new(dir.clone()));
			return Ok(Self::new(config, runtime, surface));
		}
		let gate = runtime_gate(&config)?;
		let environment = EnvironmentBuilder::from_process(config.temp_root(), &config.extra_path_dirs);
		let resolver = Some(SecretResolver::from_process(config.probe_login_shell));
		let runtime: Arc<dyn RuntimeLocator> = Arc::new(gate.clone());
		Ok(Self::assemble(config, runtime, Some(gate), surface, environment, resolver))
	}

	/// Fully explicit constructor, used by embedders and tests that control
	/// the environment and credential lookup.
	pub fn with_parts(
		config: BridgeConfig,
		runtime: Arc<dyn RuntimeLocator>,
		surface: Arc<dyn PromptSurface>,
		environment: EnvironmentBuilder,
		resolver: Option<SecretResolver>,
	) -> Self {
		Self::assemble(config, runtime, None, surface, environment, resolver)
	}

	fn assemble(
		config: BridgeConfig,
		runtime: Arc<dyn RuntimeLocator>,
		gate: Option<RuntimeGate>,
		surface: Arc<dyn PromptSurface>,
		environment: EnvironmentBuilder,
		resolver: Option<SecretResolver>,
	) -> Self {
		let correlator = PermissionCorrelator::with_config(surface, config.correlator_config());
		Self {
			inner: Arc::new(BridgeInner {
				config,
				runtime,
				gate,
				correlator,
				environment,
				resolver,
				secrets: Mutex::new(None),
				sessions: Mutex::new(HashMap::new()),
			}),
		}
	}

	pub fn config(&self) -> &BridgeConfig {
		&self.inner.config
	}

	pub fn correlator(&self) -> &PermissionCorrelator {
		&self.inner.correlator
	}

	pub fn runtime_gate(&self) -> Option<&RuntimeGate> {
		self.inner.gate.as_ref()
	}

	pub fn create_session(&self, provider: ProviderKind, settings: SessionSettings) -> Session {
		let session = Session::new(provider, settings, self.inner.config.permission_root());
		info!(session_id = %session.id(), provider = %provider, "created session");
		lock(&self.inner.sessions).insert(session.id().to_string(), session.clone());
		session
	}

	pub fn session(&self, id: &str) -> BridgeResult<Session> {
		lock(&self.inner.sessions)
			.get(id)
			.cloned()
			.ok_or_else(|| BridgeError::SessionNotFound(id.to_string()))
	}

	/// Interrupt any running turn, stop the permission watcher, deny the
	/// session's outstanding prompts and remove its permission directory.
	pub fn close_session(&self, id: &str) -> BridgeResult<()> {
		let session = lock(&self.inner.sessions)
			.remove(id)
			.ok_or_else(|| BridgeError::SessionNotFound(id.to_string()))?;
		self.interrupt(&session);
		lock(&session.inner.watcher).take();
		self.inner.correlator.cancel_scope(id, "Session closed");
		if let Err(e) = session.inner.permissions.clear() {
			warn!(session_id = %id, error = %e, "failed to remove permission directory");
		}
		info!(session_id = %id, "closed session");
		Ok(())
	}

	/// Forget cached credentials so the next turn resolves them again.
	pub fn clear_credential_cache(&self) {
		lock(&self.inner.secrets).take();
	}

	/// Run one turn to completion.
	///
	/// Fails fast with [`BridgeError::TurnInProgress`] while another turn of
	/// the same session is in flight. Launch failures are recorded in the
	/// session history, reported to the sink, and returned as
	/// [`BridgeError::Launch`]. Every other outcome, including interruption,
	/// is an `Ok` result.
	#[instrument(skip_all, fields(session_id = %session.id(), provider = %session.provider()))]
	pub async fn send_turn(
		&self,
		session: &Session,
		text: impl Into<String>,
		attachments: Vec<Attachment>,
	) -> BridgeResult<TurnResult> {
		let text = text.into();
		let provider = session.provider();
		if !attachments.is_empty() && !provider.capabilities().attachments {
			return Err(BridgeError::UnsupportedAttachments {
				provider: provider.as_str(),
			});
		}

		if let Some(gate) = &self.inner.gate {
			if !self.inner.runtime.is_ready() {
				gate.acquire().await?;
			}
		}

		let channel_id = Uuid::new_v4().to_string();
		let slot = Arc::clone(&session.inner.slot);
		let turn = slot
			.reserve(channel_id.clone())
			.ok_or_else(|| BridgeError::TurnInProgress {
				session_id: session.id().to_string(),
			})?;
		let lifecycle = Arc::new(TurnLifecycle::new(channel_id.clone(), session.sink()));
		let started_at = Utc::now();
		let permission_dir = self.ensure_permission_watcher(session);
		info!(channel_id = %channel_id, attachments = attachments.len(), "starting turn");

		let bridge = self.clone();
		let job_session = session.clone();
		let job_text = text.clone();
		let job = {
			let turn = Arc::clone(&turn);
			let slot = Arc::clone(&slot);
			let lifecycle = Arc::clone(&lifecycle);
			move || {
				let spec = bridge.prepare(&job_session, &turn, job_text, &attachments, permission_dir.as_deref());
				match spec {
					Ok(spec) => run_turn(TurnJob {
						spec,
						turn,
						slot,
						lifecycle,
					}),
					Err(e) => {
						slot.release(&turn);
						lifecycle.terminate(&TurnResult::failure(turn.channel_id(), e.to_string()));
						Err(e)
					}
				}
			}
		};

		let outcome = match tokio::task::spawn_blocking(job).await {
			Ok(Ok(result)) => Ok(result),
			Ok(Err(e)) => Err(BridgeError::Launch(e)),
			Err(e) => {
				let message = format!("turn worker failed: {e}");
				lifecycle.terminate(&TurnResult::failure(channel_id.clone(), message.clone()));
				Err(BridgeError::Internal(message))
			}
		};

		if slot.is_current(&turn) {
			self.record(session, &channel_id, text, started_at, &outcome);
		} else {
			debug!(channel_id = %channel_id, "turn finished after restart, not recorded");
		}
		outcome
	}

	fn record(
		&self,
		session: &Session,
		channel_id: &str,
		prompt: String,
		started_at: DateTime<Utc>,
		outcome: &BridgeResult<TurnResult>,
	) {
		let (response, error) = match outcome {
			Ok(result) => {
				if let Some(thread_id) = &result.thread_id {
					*lock(&session.inner.thread_id) = Some(thread_id.clone());
				}
				let response = (!result.text.is_empty()).then(|| result.text.clone());
				(response, result.error.clone())
			}
			Err(e) => (None, Some(e.to_string())),
		};
		lock(&session.inner.records).push(TurnRecord {
			channel_id: channel_id.to_string(),
			prompt,
			response,
			error,
			started_at,
			finished_at: Utc::now(),
		});
	}

	/// Assemble the process command, environment and stdin document.
	/// Blocking: credential lookup may run a login shell.
	fn prepare(
		&self,
		session: &Session,
		turn: &ActiveTurn,
		text: String,
		attachments: &[Attachment],
		permission_dir: Option<&Path>,
	) -> Result<LaunchSpec, LaunchError> {
		let runtime_dir = self
			.inner
			.runtime
			.find_runtime_dir()
			.ok_or(LaunchError::RuntimeNotReady)?;
		let provider = session.provider();
		let capabilities = provider.capabilities();
		let settings = session.settings();
		let working_dir = resolve_working_dir(settings.working_directory.as_deref(), &runtime_dir);

		let command = match &self.inner.config.bridge_command {
			Some(argv) => AgentCommand::from_argv(argv)?,
			None => AgentCommand::bridge(self.inner.config.node_path.clone(), &runtime_dir, provider),
		};

		let (message, system_prompt) = match settings.system_prompt {
			Some(instructions) if capabilities.system_role => (text, Some(instructions)),
			Some(instructions) => (format!("{text}\n\n{instructions}"), None),
			None => (text, None),
		};
		let session_id = if capabilities.session_resume {
			session.thread_id().unwrap_or_default()
		} else {
			String::new()
		};

		let env = self
			.inner
			.environment
			.clone()
			.with_secrets(self.secrets())
			.build(&TurnContext {
				session_id: session.id(),
				channel_id: turn.channel_id(),
				provider,
				permission_mode: settings.permission_mode,
				permission_dir,
			});

		let input = TurnInput {
			message,
			session_id,
			cwd: working_dir.clone(),
			permission_mode: settings.permission_mode,
			model: settings.model,
			reasoning_effort: settings.reasoning_effort,
			system_prompt,
			attachments: attachments.iter().map(Attachment::to_payload).collect(),
			channel_id: turn.channel_id().to_string(),
		};

		Ok(LaunchSpec {
			command,
			working_dir,
			env,
			input,
		})
	}

	fn secrets(&self) -> BTreeMap<String, SecretString> {
		let mut cache = lock(&self.inner.secrets);
		if let Some(secrets) = cache.as_ref() {
			return secrets.clone();
		}
		let resolved = self
			.inner
			.resolver
			.as_ref()
			.map(SecretResolver::resolve)
			.unwrap_or_default();
		*cache = Some(resolved.clone());
		resolved
	}

	fn ensure_permission_watcher(&self, session: &Session) -> Option<PathBuf> {
		let mut watcher = lock(&session.inner.watcher);
		let dir = match session.inner.permissions.init(session.id()) {
			Ok(dir) => dir,
			Err(e) => {
				warn!(session_id = %session.id(), error = %e, "permission directory unavailable");
				return None;
			}
		};
		if watcher.is_none() {
			*watcher = Some(PermissionWatcher::spawn(
				dir.clone(),
				session.id(),
				self.inner.correlator.clone(),
			));
		}
		Some(dir)
	}

	/// Interrupt the session's in-flight turn. Returns `false` if idle.
	///
	/// The turn resolves as "User interrupted" whatever the process exit
	/// status turns out to be.
	pub fn interrupt(&self, session: &Session) -> bool {
		match session.inner.slot.active() {
			Some(turn) => {
				info!(session_id = %session.id(), channel_id = %turn.channel_id(), "interrupt requested");
				turn.interrupt();
				true
			}
			None => false,
		}
	}

	/// Stop the running turn, drop any output it still produces, and start
	/// the conversation over.
	pub fn restart(&self, session: &Session) {
		let generation = session.inner.slot.bump_generation();
		self.interrupt(session);
		lock(&session.inner.thread_id).take();
		lock(&session.inner.records).clear();
		info!(session_id = %session.id(), generation, "session restarted");
	}

	/// Deliver the user's decision for a pending permission prompt. Returns
	/// `false` if the prompt already resolved or never existed.
	pub fn resolve_permission(&self, channel_id: &str, decision: PermissionDecision) -> bool {
		self.inner.correlator.resolve(channel_id, decision)
	}
}

fn runtime_gate(config: &BridgeConfig) -> BridgeResult<RuntimeGate> {
	let archive = config.bundle_archive.clone().ok_or_else(|| {
		ConfigError::invalid_value("runtime_dir", "set runtime_dir or bundle_archive")
	})?;
	let source = BundleSource::new(archive, config.bundle_version.clone(), config.install_root()?);
	Ok(RuntimeGate::new(source, Arc::new(ZipExtractor)))
}
