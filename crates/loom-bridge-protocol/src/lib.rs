// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Wire protocol for bridged agent processes.
//!
//! An agent process writes newline-delimited UTF-8 to stdout. Each line is
//! either a bracket-tagged event (`[TAG]` followed by an optional payload) or
//! a free-form diagnostic line. This crate decodes those lines into
//! [`ProtocolEvent`]s without knowing anything about the transport, and owns
//! the single JSON document ([`TurnInput`]) written to the process's stdin.

pub mod decode;
pub mod error;
pub mod event;
pub mod input;
pub mod message;

pub use decode::{decode_line, encode_event, Tag};
pub use error::{ProtocolError, ProtocolResult};
pub use event::{Diagnostic, DiagnosticKind, ProtocolEvent};
pub use input::{AttachmentPayload, PermissionMode, TurnInput};
pub use message::{AgentMessage, ContentBlock, MessageBody, MessageContent};
