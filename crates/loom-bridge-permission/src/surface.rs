// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use async_trait::async_trait;

use crate::error::SurfaceError;
use crate::prompt::PermissionRequest;

/// Where prompts are shown to the user.
///
/// `show_prompt` only displays; the decision comes back later through
/// [`crate::PermissionCorrelator::resolve`] with the request's channel id.
/// Implementations marshal onto their presentation thread themselves.
#[async_trait]
pub trait PromptSurface: Send + Sync {
	async fn show_prompt(&self, request: &PermissionRequest) -> Result<(), SurfaceError>;
}

/// A surface that shows nothing. Every prompt runs into its deadline.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessSurface;

#[async_trait]
impl PromptSurface for HeadlessSurface {
	async fn show_prompt(&self, _request: &PermissionRequest) -> Result<(), SurfaceError> {
		Ok(())
	}
}
