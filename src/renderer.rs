/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `Renderer`: owns pages, boots its backend lazily, dispatches commands.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};
use tokio::sync::broadcast;

use crate::backend::{Backend, Command, CommandOutput};
use crate::page::{Page, PageStatus, PageTransition};
use crate::supervisor::WorkerBackend;
use crate::types::{LoadOptions, RendererError, RendererEvent, WorkerOptions};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Boot lifecycle of a renderer. Exactly one status holds at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RendererStatus {
    #[default]
    Idle,
    Booting,
    Booted,
    ShuttingDown,
}

/// Requested change of a renderer's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererTransition {
    Booting,
    /// Booting stopped without success.
    BootAborted,
    Booted,
    /// The backend is no longer booted.
    Halted,
    ShuttingDown,
}

impl RendererStatus {
    /// Compute the status after `transition`. Boot cannot start or abort
    /// while shutting down, and only a booted renderer can shut down.
    pub fn apply(self, transition: RendererTransition) -> Result<RendererStatus, RendererError> {
        use RendererStatus as S;
        use RendererTransition as T;

        match (self, transition) {
            (S::ShuttingDown, T::Booting | T::BootAborted) => Err(RendererError::precondition(
                "cannot change boot state while shutting down",
            )),
            (_, T::Booting) => Ok(S::Booting),
            (_, T::BootAborted) => Ok(S::Idle),
            (_, T::Booted) => Ok(S::Booted),
            (_, T::Halted) => Ok(S::Idle),
            (S::Booted, T::ShuttingDown) => Ok(S::ShuttingDown),
            (_, T::ShuttingDown) => Err(RendererError::precondition(format!(
                "cannot shut down a renderer that is {self}"
            ))),
        }
    }
}

impl fmt::Display for RendererStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RendererStatus::Idle => "idle",
            RendererStatus::Booting => "booting",
            RendererStatus::Booted => "booted",
            RendererStatus::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

/// State shared between a renderer, its backend, and the backend's tasks.
pub struct RendererState {
    status: Mutex<RendererStatus>,
    pages: Mutex<Vec<Arc<Page>>>,
    events: broadcast::Sender<RendererEvent>,
}

impl RendererState {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            status: Mutex::new(RendererStatus::Idle),
            pages: Mutex::new(Vec::new()),
            events,
        }
    }

    fn status_guard(&self) -> MutexGuard<'_, RendererStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pages_guard(&self) -> MutexGuard<'_, Vec<Arc<Page>>> {
        self.pages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> RendererStatus {
        *self.status_guard()
    }

    pub fn is_booting(&self) -> bool {
        self.status() == RendererStatus::Booting
    }

    pub fn is_booted(&self) -> bool {
        self.status() == RendererStatus::Booted
    }

    pub fn is_shutting_down(&self) -> bool {
        self.status() == RendererStatus::ShuttingDown
    }

    /// Apply `transition` atomically, returning the new status.
    pub fn transition(
        &self,
        transition: RendererTransition,
    ) -> Result<RendererStatus, RendererError> {
        let mut status = self.status_guard();
        let next = status.apply(transition)?;
        if *status != next {
            debug!("renderer: {} -> {}", *status, next);
        }
        *status = next;
        Ok(next)
    }

    /// Move to `Booting` unless a boot is already under way or done.
    /// Returns whether this caller started the boot.
    pub fn begin_boot(&self) -> Result<bool, RendererError> {
        let mut status = self.status_guard();
        match *status {
            RendererStatus::Booting | RendererStatus::Booted => Ok(false),
            current => {
                *status = current.apply(RendererTransition::Booting)?;
                Ok(true)
            }
        }
    }

    pub fn find(&self, id: &str) -> Option<Arc<Page>> {
        self.pages_guard().iter().find(|page| page.id() == id).cloned()
    }

    /// Snapshot of the tracked pages, in creation order.
    pub fn pages(&self) -> Vec<Arc<Page>> {
        self.pages_guard().clone()
    }

    pub(crate) fn contains(&self, page: &Arc<Page>) -> bool {
        self.pages_guard().iter().any(|p| Arc::ptr_eq(p, page))
    }

    fn find_or_insert(&self, id: &str, make: impl FnOnce() -> Arc<Page>) -> Arc<Page> {
        let mut pages = self.pages_guard();
        if let Some(page) = pages.iter().find(|page| page.id() == id) {
            return page.clone();
        }
        let page = make();
        pages.push(page.clone());
        page
    }

    pub(crate) fn remove_page(&self, page: &Arc<Page>) {
        self.pages_guard().retain(|p| !Arc::ptr_eq(p, page));
    }

    /// Empty the collection, marking every page destroyed.
    pub(crate) fn clear_pages(&self) {
        let pages = std::mem::take(&mut *self.pages_guard());
        for page in pages {
            let _ = page.transition(PageTransition::Destroyed);
        }
    }

    /// The backend lost its worker: abort a pending boot, and tear the page
    /// collection down if the renderer was up.
    pub(crate) fn backend_lost(&self) {
        let previous = {
            let mut status = self.status_guard();
            let previous = *status;
            *status = RendererStatus::Idle;
            previous
        };

        if matches!(
            previous,
            RendererStatus::Booted | RendererStatus::ShuttingDown
        ) {
            self.clear_pages();
        }
        info!("renderer backend lost while {previous}");
    }

    pub fn publish(&self, event: RendererEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RendererEvent> {
        self.events.subscribe()
    }
}

pub(crate) struct RendererInner {
    pub(crate) state: Arc<RendererState>,
    backend: Box<dyn Backend>,
    boot_guard: tokio::sync::Mutex<()>,
}

impl RendererInner {
    async fn boot(&self) -> Result<(), RendererError> {
        let _guard = self.boot_guard.lock().await;
        if self.state.is_booted() {
            return Ok(());
        }
        info!("booting {} backend", self.backend.name());
        self.backend.boot(&self.state).await
    }

    /// The single admission point for page commands.
    pub(crate) async fn exec(
        self: &Arc<Self>,
        page: &Arc<Page>,
        command: Command,
    ) -> Result<CommandOutput, RendererError> {
        if !page.belongs_to(self) || !self.state.contains(page) {
            return Err(RendererError::precondition(format!(
                "page {:?} is not owned by this renderer",
                page.id()
            )));
        }

        match (page.status(), &command) {
            (PageStatus::Destroyed, _) => {
                return Err(RendererError::precondition(format!(
                    "page {:?} is destroyed",
                    page.id()
                )));
            }
            (PageStatus::Destroying, Command::Load(_) | Command::Render(_)) => {
                return Err(RendererError::precondition(format!(
                    "page {:?} is being destroyed; only unload is allowed",
                    page.id()
                )));
            }
            _ => {}
        }

        if !self.state.is_booted() {
            self.boot().await?;
        }

        debug!("exec {} on page {:?}", command.name(), page.id());
        let state = &self.state;
        match command {
            Command::Load(options) => self
                .backend
                .load_page(state, page, options)
                .await
                .map(|()| CommandOutput::Loaded),
            Command::Render(options) => self
                .backend
                .render_page(state, page, options)
                .await
                .map(CommandOutput::Rendered),
            Command::Unload => self
                .backend
                .unload_page(state, page)
                .await
                .map(CommandOutput::Unloaded),
        }
    }
}

/// Owns a collection of pages and the backend that renders them.
///
/// Cloning is cheap; clones share pages and backend.
#[derive(Clone)]
pub struct Renderer {
    inner: Arc<RendererInner>,
}

impl Renderer {
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self {
            inner: Arc::new(RendererInner {
                state: Arc::new(RendererState::new()),
                backend: Box::new(backend),
                boot_guard: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// A renderer backed by a spawned worker process.
    pub fn worker(options: WorkerOptions) -> Result<Self, RendererError> {
        Ok(Self::new(WorkerBackend::new(options)?))
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    pub fn state(&self) -> &Arc<RendererState> {
        &self.inner.state
    }

    pub fn status(&self) -> RendererStatus {
        self.inner.state.status()
    }

    pub fn is_booting(&self) -> bool {
        self.inner.state.is_booting()
    }

    pub fn is_booted(&self) -> bool {
        self.inner.state.is_booted()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.is_shutting_down()
    }

    pub fn pages(&self) -> Vec<Arc<Page>> {
        self.inner.state.pages()
    }

    pub fn find(&self, id: &str) -> Option<Arc<Page>> {
        self.inner.state.find(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RendererEvent> {
        self.inner.state.subscribe()
    }

    pub fn ptr_eq(&self, other: &Renderer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Load the page `id`, creating it on first use.
    pub async fn load(&self, id: &str, options: LoadOptions) -> Result<Arc<Page>, RendererError> {
        if id.is_empty() || id.contains(['\n', '\r']) {
            return Err(RendererError::precondition(format!(
                "invalid page id {id:?}"
            )));
        }

        let weak = Arc::downgrade(&self.inner);
        let page = self
            .inner
            .state
            .find_or_insert(id, || Page::new(id, weak));
        page.load(options).await
    }

    /// Reconcile the page collection with the backend's open pages. Unknown
    /// ids become tracked pages and every reported page is marked loaded.
    /// Failures are logged and otherwise ignored.
    pub async fn refresh(&self) {
        let state = &self.inner.state;
        let ids = match self.inner.backend.ping(state).await {
            Ok(ids) => ids,
            Err(err) => {
                debug!("refresh skipped: {err}");
                return;
            }
        };

        for id in ids {
            let weak = Arc::downgrade(&self.inner);
            let page = state.find_or_insert(&id, || Page::new(id.as_str(), weak));
            if let Err(err) = page.transition(PageTransition::Loaded) {
                debug!("refresh left page {id:?} as is: {err}");
            }
        }
    }

    /// Shut the backend down and drop every page. Does nothing unless booted.
    pub async fn destroy(&self) -> Result<(), RendererError> {
        let state = &self.inner.state;
        if !state.is_booted() {
            return Ok(());
        }

        state.transition(RendererTransition::ShuttingDown)?;
        let result = self.inner.backend.shutdown(state).await;

        state.clear_pages();
        state.transition(RendererTransition::Halted)?;
        result
    }

    /// Boot the backend. Concurrent callers share a single boot.
    pub async fn boot(&self) -> Result<(), RendererError> {
        self.inner.boot().await
    }

    pub async fn shutdown(&self) -> Result<(), RendererError> {
        self.inner.backend.shutdown(&self.inner.state).await
    }

    pub async fn ping(&self) -> Result<Vec<String>, RendererError> {
        self.inner.backend.ping(&self.inner.state).await
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<RendererInner> {
        &self.inner
    }
}

impl fmt::Debug for Renderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderer")
            .field("backend", &self.backend_name())
            .field("status", &self.status())
            .field("pages", &self.pages())
            .finish()
    }
}
