/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `Page`: one logical document session owned by a renderer.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::debug;

use crate::backend::{Command, CommandOutput};
use crate::renderer::RendererInner;
use crate::types::{LoadOptions, RenderOptions, RenderOutput, RendererError};

/// Lifecycle of a page. Exactly one status holds at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PageStatus {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Destroying,
    Destroyed,
}

/// Requested change of a page's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTransition {
    /// A load started.
    Loading,
    /// A load completed.
    Loaded,
    /// A load failed; clears `Loading` and `Loaded`.
    LoadAborted,
    /// An unload started.
    Destroying,
    /// An unload failed or was refused; clears `Destroying`.
    DestroyAborted,
    /// The backend confirmed the unload.
    Destroyed,
}

impl PageStatus {
    /// Compute the status after `transition`.
    ///
    /// Loading a destroying or destroyed page is rejected, as is starting a
    /// second unload. Aborts that do not apply to the current status leave it
    /// unchanged.
    pub fn apply(self, transition: PageTransition) -> Result<PageStatus, RendererError> {
        use PageStatus as S;
        use PageTransition as T;

        match (self, transition) {
            (S::Destroying | S::Destroyed, T::Loading | T::Loaded) => Err(
                RendererError::precondition(format!("cannot load a page that is {self}")),
            ),
            (S::Destroying | S::Destroyed, T::LoadAborted) => Ok(self),
            (_, T::Loading) => Ok(S::Loading),
            (_, T::Loaded) => Ok(S::Loaded),
            (_, T::LoadAborted) => Ok(S::Unloaded),

            (S::Destroying | S::Destroyed, T::Destroying) => Err(RendererError::precondition(
                format!("cannot destroy a page that is {self}"),
            )),
            (_, T::Destroying) => Ok(S::Destroying),
            (S::Destroying, T::DestroyAborted) => Ok(S::Unloaded),
            (_, T::DestroyAborted) => Ok(self),
            (_, T::Destroyed) => Ok(S::Destroyed),
        }
    }
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PageStatus::Unloaded => "unloaded",
            PageStatus::Loading => "loading",
            PageStatus::Loaded => "loaded",
            PageStatus::Destroying => "destroying",
            PageStatus::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// A document session, tracked by id on both sides of the process boundary.
///
/// Pages are created by their [`Renderer`](crate::Renderer) and keep a
/// reference to it for their whole life. All commands go through the
/// renderer's dispatch, which boots the backend on first use.
pub struct Page {
    id: String,
    status: Mutex<PageStatus>,
    renderer: Weak<RendererInner>,
}

impl Page {
    pub(crate) fn new(id: impl Into<String>, renderer: Weak<RendererInner>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            status: Mutex::new(PageStatus::Unloaded),
            renderer,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn status_guard(&self) -> MutexGuard<'_, PageStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> PageStatus {
        *self.status_guard()
    }

    pub fn is_loading(&self) -> bool {
        self.status() == PageStatus::Loading
    }

    pub fn is_loaded(&self) -> bool {
        self.status() == PageStatus::Loaded
    }

    pub fn is_destroying(&self) -> bool {
        self.status() == PageStatus::Destroying
    }

    pub fn is_destroyed(&self) -> bool {
        self.status() == PageStatus::Destroyed
    }

    /// Apply `transition` atomically, returning the new status.
    pub fn transition(&self, transition: PageTransition) -> Result<PageStatus, RendererError> {
        let mut status = self.status_guard();
        let next = status.apply(transition)?;
        if *status != next {
            debug!("page {:?}: {} -> {}", self.id, *status, next);
        }
        *status = next;
        Ok(next)
    }

    pub(crate) fn belongs_to(&self, renderer: &Arc<RendererInner>) -> bool {
        std::ptr::eq(self.renderer.as_ptr(), Arc::as_ptr(renderer))
    }

    fn renderer(&self) -> Result<Arc<RendererInner>, RendererError> {
        self.renderer
            .upgrade()
            .ok_or_else(|| RendererError::precondition("the page's renderer was dropped"))
    }

    /// Load the page. Completion is reported by the backend, which marks the
    /// page loaded; on failure the loading mark is cleared.
    pub async fn load(self: &Arc<Self>, options: LoadOptions) -> Result<Arc<Self>, RendererError> {
        let status = self.status();
        if matches!(status, PageStatus::Destroying | PageStatus::Destroyed) {
            return Err(RendererError::precondition(format!(
                "cannot load page {:?}: it is {status}",
                self.id
            )));
        }

        let renderer = self.renderer()?;
        if let Err(err) = renderer.exec(self, Command::Load(options)).await {
            let _ = self.transition(PageTransition::LoadAborted);
            return Err(err);
        }

        Ok(self.clone())
    }

    /// Render the loaded page.
    ///
    /// Accepts a filename (`"out.pdf"`) or full [`RenderOptions`]. Without an
    /// explicit format, the filename's extension picks one.
    pub async fn render(
        self: &Arc<Self>,
        options: impl Into<RenderOptions>,
    ) -> Result<RenderOutput, RendererError> {
        let status = self.status();
        if status != PageStatus::Loaded {
            return Err(RendererError::precondition(format!(
                "cannot render page {:?}: it is {status}",
                self.id
            )));
        }

        let mut options = options.into();
        options.infer_format();

        let renderer = self.renderer()?;
        match renderer.exec(self, Command::Render(options)).await? {
            CommandOutput::Rendered(output) => Ok(output),
            other => Err(unexpected_output("render", other)),
        }
    }

    /// Render to `filename`, with further options.
    pub async fn render_to(
        self: &Arc<Self>,
        filename: impl Into<std::path::PathBuf>,
        options: RenderOptions,
    ) -> Result<RenderOutput, RendererError> {
        self.render(RenderOptions {
            filename: Some(filename.into()),
            ..options
        })
        .await
    }

    /// Unload the page. Once the backend confirms, the page leaves its
    /// renderer's collection and is marked destroyed. Returns whether the
    /// backend confirmed.
    pub async fn destroy(self: &Arc<Self>) -> Result<bool, RendererError> {
        self.transition(PageTransition::Destroying)?;

        let result = match self.renderer() {
            Ok(renderer) => renderer
                .exec(self, Command::Unload)
                .await
                .map(|output| (renderer, output)),
            Err(err) => Err(err),
        };

        match result {
            Ok((renderer, CommandOutput::Unloaded(true))) => {
                renderer.state.remove_page(self);
                self.transition(PageTransition::Destroyed)?;
                Ok(true)
            }
            Ok((_, CommandOutput::Unloaded(false))) => {
                self.transition(PageTransition::DestroyAborted)?;
                Ok(false)
            }
            Ok((_, other)) => {
                let _ = self.transition(PageTransition::DestroyAborted);
                Err(unexpected_output("unload", other))
            }
            Err(err) => {
                let _ = self.transition(PageTransition::DestroyAborted);
                Err(err)
            }
        }
    }
}

fn unexpected_output(command: &str, output: CommandOutput) -> RendererError {
    RendererError::precondition(format!(
        "backend returned {output:?} for a {command} command"
    ))
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [PageStatus; 5] = [
        PageStatus::Unloaded,
        PageStatus::Loading,
        PageStatus::Loaded,
        PageStatus::Destroying,
        PageStatus::Destroyed,
    ];

    #[test]
    fn loaded_and_loading_replace_each_other() {
        let loading = PageStatus::Loaded.apply(PageTransition::Loading).unwrap();
        assert_eq!(loading, PageStatus::Loading);
        let loaded = loading.apply(PageTransition::Loaded).unwrap();
        assert_eq!(loaded, PageStatus::Loaded);
    }

    #[test]
    fn destroying_clears_load_state() {
        for status in [PageStatus::Unloaded, PageStatus::Loading, PageStatus::Loaded] {
            assert_eq!(
                status.apply(PageTransition::Destroying).unwrap(),
                PageStatus::Destroying
            );
        }
    }

    #[test]
    fn destroyed_clears_everything() {
        for status in ALL {
            assert_eq!(
                status.apply(PageTransition::Destroyed).unwrap(),
                PageStatus::Destroyed
            );
        }
    }

    #[test]
    fn cannot_load_destroying_or_destroyed() {
        for status in [PageStatus::Destroying, PageStatus::Destroyed] {
            for transition in [PageTransition::Loading, PageTransition::Loaded] {
                let err = status.apply(transition).unwrap_err();
                assert!(matches!(err, RendererError::PreconditionViolation(_)));
            }
        }
    }

    #[test]
    fn cannot_destroy_twice() {
        assert!(PageStatus::Destroying.apply(PageTransition::Destroying).is_err());
        assert!(PageStatus::Destroyed.apply(PageTransition::Destroying).is_err());
    }

    #[test]
    fn aborts_only_touch_their_own_state() {
        assert_eq!(
            PageStatus::Loading.apply(PageTransition::LoadAborted).unwrap(),
            PageStatus::Unloaded
        );
        assert_eq!(
            PageStatus::Loaded.apply(PageTransition::LoadAborted).unwrap(),
            PageStatus::Unloaded
        );
        assert_eq!(
            PageStatus::Destroying.apply(PageTransition::LoadAborted).unwrap(),
            PageStatus::Destroying
        );
        assert_eq!(
            PageStatus::Destroying.apply(PageTransition::DestroyAborted).unwrap(),
            PageStatus::Unloaded
        );
        assert_eq!(
            PageStatus::Loaded.apply(PageTransition::DestroyAborted).unwrap(),
            PageStatus::Loaded
        );
    }

    #[test]
    fn orphaned_page_reports_precondition() {
        let page = Page::new("orphan", Weak::new());
        assert!(matches!(
            page.renderer(),
            Err(RendererError::PreconditionViolation(_))
        ));
    }
}
