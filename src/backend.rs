/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The backend seam: what a rendering engine integration must provide.

use std::sync::Arc;

use async_trait::async_trait;

use crate::page::Page;
use crate::renderer::RendererState;
use crate::types::{LoadOptions, RenderOptions, RenderOutput, RendererError};

/// A command dispatched against one page.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Load(LoadOptions),
    Render(RenderOptions),
    Unload,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Load(_) => "load",
            Command::Render(_) => "render",
            Command::Unload => "unload",
        }
    }
}

/// What a dispatched command produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    Loaded,
    Rendered(RenderOutput),
    /// Whether the backend confirmed the unload.
    Unloaded(bool),
}

/// Rendering backend driven by a [`Renderer`](crate::Renderer).
///
/// Every operation receives the renderer's shared state so the backend can
/// update boot and page status, including from tasks it spawns. The default
/// implementations fail with [`RendererError::NotImplemented`].
///
/// `load_page` is done when the page is loaded: a backend either marks it
/// loaded itself before returning or waits until something else does.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn boot(&self, _state: &Arc<RendererState>) -> Result<(), RendererError> {
        Err(RendererError::NotImplemented("boot"))
    }

    async fn shutdown(&self, _state: &Arc<RendererState>) -> Result<(), RendererError> {
        Err(RendererError::NotImplemented("shutdown"))
    }

    /// Ids of the pages currently open in the backend.
    async fn ping(&self, _state: &Arc<RendererState>) -> Result<Vec<String>, RendererError> {
        Err(RendererError::NotImplemented("ping"))
    }

    async fn load_page(
        &self,
        _state: &Arc<RendererState>,
        _page: &Arc<Page>,
        _options: LoadOptions,
    ) -> Result<(), RendererError> {
        Err(RendererError::NotImplemented("loadPage"))
    }

    async fn render_page(
        &self,
        _state: &Arc<RendererState>,
        _page: &Arc<Page>,
        _options: RenderOptions,
    ) -> Result<RenderOutput, RendererError> {
        Err(RendererError::NotImplemented("renderPage"))
    }

    /// Returns whether the backend confirmed the unload.
    async fn unload_page(
        &self,
        _state: &Arc<RendererState>,
        _page: &Arc<Page>,
    ) -> Result<bool, RendererError> {
        Err(RendererError::NotImplemented("unloadPage"))
    }
}

/// A backend providing none of the operations.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl Backend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }
}
