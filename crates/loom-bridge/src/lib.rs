// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Agent session bridge.
//!
//! A [`SessionBridge`] runs conversational turns against an external agent
//! process. Each turn spawns one process with a prepared environment,
//! writes a single JSON document to its stdin, decodes its tagged stdout
//! line by line, and feeds the events to a [`TurnSink`] until the process
//! exits. Permission prompts raised by the agent are correlated with user
//! decisions by [`loom_bridge_permission`], and the bridge scripts
//! themselves are unpacked once by [`loom_bridge_runtime`].

pub mod aggregate;
pub mod config;
pub mod dispatcher;
pub mod environment;
pub mod error;
pub mod launcher;
pub mod provider;
pub mod secrets;
pub mod session;
pub mod settings;

pub use aggregate::AssistantTextAggregator;
pub use config::{default_config_path, BridgeConfig, ConfigError, PermissionTimeouts};
pub use dispatcher::{ExitSummary, NullSink, TurnResult, TurnSink, TurnState, INTERRUPTED_MESSAGE};
pub use environment::{EnvironmentBuilder, TurnContext, TurnEnvironment};
pub use error::{BridgeError, BridgeResult, LaunchError};
pub use launcher::{locate_executable, resolve_working_dir, AgentCommand};
pub use provider::{CodexPolicy, Platform, ProviderCapabilities, ProviderKind};
pub use secrets::{SecretResolver, SecretString, SECRET_NAMES};
pub use session::{Attachment, Session, SessionBridge, TurnRecord};
pub use settings::{MemorySettings, SessionSettings, SettingsStore, TomlSettingsStore};

pub use loom_bridge_permission::{PermissionDecision, PermissionOutcome, PromptSurface};
pub use loom_bridge_protocol::{PermissionMode, ProtocolEvent};
