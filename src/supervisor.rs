/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Out-of-process backend: spawns the worker and drives it.
//!
//! The worker is reached over three channels. The boot handshake writes the
//! port to its stdin. Commands go over HTTP. Boot and load completion come
//! back as sentinel records on its stdout, consumed by a reader task that
//! updates renderer and page status directly. Waiting for remote state is
//! done by polling that local status.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::header;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use url::Url;

use crate::backend::Backend;
use crate::page::{Page, PageTransition};
use crate::protocol::{
    Endpoint, LoadPageBody, PageRef, PingResponse, RenderPageBody, SERVER_NAME, Sentinel,
    SentinelDecoder, SentinelKind, StdoutLine,
};
use crate::renderer::{RendererState, RendererTransition};
use crate::types::{
    LoadOptions, RenderOptions, RenderOutput, RendererError, RendererEvent, WorkerOptions,
};
use crate::wait::wait_until;

type ProcessSlot = Mutex<Option<WorkerProcess>>;

/// A spawned worker, as tracked by the backend.
struct WorkerProcess {
    generation: u64,
    /// Open until boot completes.
    stdin: Option<ChildStdin>,
    /// Cleared by the exit watcher once the process is gone.
    alive: Arc<AtomicBool>,
    /// Sending (or dropping) this makes the exit watcher kill the process.
    kill: oneshot::Sender<()>,
    watcher: JoinHandle<()>,
}

/// What a successful control request produced.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
    Body(String),
    Location(String),
}

/// HTTP side of the connection to a worker.
struct ControlChannel {
    client: reqwest::Client,
    base_url: String,
}

impl ControlChannel {
    async fn send(
        &self,
        state: &RendererState,
        endpoint: Endpoint,
        body: Option<serde_json::Value>,
    ) -> Result<Reply, RendererError> {
        let url = format!("{}{}", self.base_url, endpoint.path());
        let request = match body {
            Some(body) => self.client.post(&url).json(&body),
            None => self.client.get(&url),
        };

        debug!("-> {endpoint}");
        let response = request.send().await.map_err(|err| RendererError::Unreachable {
            url: url.clone(),
            reason: err.to_string(),
        })?;

        let stamped = response
            .headers()
            .get(header::SERVER)
            .is_some_and(|value| value == SERVER_NAME);
        observe_server_header(state, stamped);

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response
            .text()
            .await
            .map_err(|err| RendererError::Unreachable {
                url: url.clone(),
                reason: err.to_string(),
            })?;
        debug!("<- {endpoint} {status}");

        match (status, location) {
            (200..=299, _) => Ok(Reply::Body(body)),
            (300..=399, Some(location)) => Ok(Reply::Location(location)),
            (404, _) => Err(RendererError::PageNotFound(body)),
            (status, _) => Err(RendererError::UnexpectedResponse { url, status, body }),
        }
    }
}

/// Every response doubles as a liveness probe: only a stamped response
/// proves the worker is up.
fn observe_server_header(state: &RendererState, stamped: bool) {
    let transition = match (stamped, state.is_shutting_down()) {
        (true, true) => return,
        (true, false) => RendererTransition::Booted,
        (false, _) => RendererTransition::Halted,
    };
    if let Err(err) = state.transition(transition) {
        debug!("ignoring server header: {err}");
    }
}

/// Apply one sentinel record to the renderer's state. Records about pages
/// the renderer does not track are dropped.
pub(crate) fn apply_sentinel(state: &RendererState, sentinel: &Sentinel) {
    let result = match sentinel.kind {
        SentinelKind::WillBoot => {
            if !sentinel.flag() || state.is_booted() {
                return;
            }
            state.transition(RendererTransition::Booting).map(drop)
        }
        SentinelKind::DidBoot => {
            let transition = if sentinel.flag() {
                RendererTransition::Booted
            } else {
                RendererTransition::BootAborted
            };
            state.transition(transition).map(drop)
        }
        SentinelKind::WillLoadPage | SentinelKind::DidLoadPage => {
            let Some(page) = state.find(&sentinel.data) else {
                debug!(
                    "dropping {} for untracked page {:?}",
                    sentinel.kind.token(),
                    sentinel.data
                );
                return;
            };
            let transition = if sentinel.kind == SentinelKind::WillLoadPage {
                PageTransition::Loading
            } else {
                PageTransition::Loaded
            };
            page.transition(transition).map(drop)
        }
    };

    if let Err(err) = result {
        debug!("ignoring {}: {err}", sentinel.kind.token());
    }
}

fn dispatch_stdout(state: &RendererState, line: StdoutLine) {
    match line {
        StdoutLine::Sentinel(sentinel) => {
            debug!("sentinel {} {:?}", sentinel.kind.token(), sentinel.data);
            apply_sentinel(state, &sentinel);
        }
        StdoutLine::Message(message) => {
            debug!("worker: {message}");
            state.publish(RendererEvent::Message(message));
        }
    }
}

async fn read_stdout(stdout: ChildStdout, state: Arc<RendererState>) {
    let mut lines = BufReader::new(stdout).lines();
    let mut decoder = SentinelDecoder::new();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(item) = decoder.feed(&line) {
                    dispatch_stdout(&state, item);
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!("failed to read worker stdout: {err}");
                break;
            }
        }
    }

    if let Some(item) = decoder.finish() {
        dispatch_stdout(&state, item);
    }
}

async fn read_stderr(stderr: ChildStderr, state: Arc<RendererState>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                warn!("worker: {line}");
                state.publish(RendererEvent::Error(line));
            }
            Ok(None) => break,
            Err(err) => {
                warn!("failed to read worker stderr: {err}");
                break;
            }
        }
    }
}

/// Wait for the worker to exit, or kill it on request. An exit the backend
/// did not ask for resets the renderer.
async fn watch_exit(
    mut child: Child,
    mut kill: oneshot::Receiver<()>,
    generation: u64,
    alive: Arc<AtomicBool>,
    slot: Weak<ProcessSlot>,
    state: Arc<RendererState>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = &mut kill => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            debug!("killing worker");
            if let Err(err) = child.kill().await {
                warn!("failed to kill worker: {err}");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => {
            info!("worker exited: {status}");
            status.code()
        }
        Err(err) => {
            error!("failed to wait for worker: {err}");
            None
        }
    };

    let unexpected = match slot.upgrade() {
        Some(slot) => {
            let mut slot = slot.lock().await;
            let current = slot
                .as_ref()
                .is_some_and(|process| process.generation == generation);
            if current {
                *slot = None;
            }
            current
        }
        None => false,
    };

    if unexpected {
        state.backend_lost();
    }
    alive.store(false, Ordering::SeqCst);
    state.publish(RendererEvent::WorkerExited(code));
}

/// Resolve the URL a page loads when no markup is given. A relative `url` is
/// resolved against the page id; without one, the id itself must be a URL.
fn resolve_url(id: &str, url: Option<&str>) -> Result<String, RendererError> {
    let not_a_url = |err: url::ParseError| {
        RendererError::precondition(format!(
            "page {id:?} has no html and no absolute url to load: {err}"
        ))
    };

    let resolved = match url {
        Some(url) => match Url::parse(url) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(id)
                .and_then(|base| base.join(url))
                .map_err(not_a_url)?,
            Err(err) => return Err(not_a_url(err)),
        },
        None => Url::parse(id).map_err(not_a_url)?,
    };
    Ok(resolved.into())
}

fn with_page_id(err: RendererError, page: &Page) -> RendererError {
    match err {
        RendererError::PageNotFound(_) => RendererError::PageNotFound(page.id().to_string()),
        other => other,
    }
}

fn json_body(body: &impl Serialize) -> Result<serde_json::Value, RendererError> {
    Ok(serde_json::to_value(body)?)
}

/// Backend running pages in a spawned `render-vendor-worker` process.
pub struct WorkerBackend {
    options: WorkerOptions,
    channel: Arc<ControlChannel>,
    process: Arc<ProcessSlot>,
    generation: AtomicU64,
}

impl WorkerBackend {
    pub fn new(options: WorkerOptions) -> Result<Self, RendererError> {
        // Render replies are 303s; they must reach us unfollowed.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            channel: Arc::new(ControlChannel {
                client,
                base_url: options.base_url(),
            }),
            options,
            process: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        })
    }

    fn spawn(&self, state: &Arc<RendererState>) -> Result<WorkerProcess, RendererError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut child = Command::new(&self.options.program)
            .arg("--host")
            .arg(&self.options.host)
            .args(&self.options.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RendererError::Spawn)?;

        info!(
            "spawned worker {} (pid {:?})",
            self.options.program.display(),
            child.id()
        );

        let stdin = child.stdin.take();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_stdout(stdout, state.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_stderr(stderr, state.clone()));
        }

        let alive = Arc::new(AtomicBool::new(true));
        let (kill, kill_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_exit(
            child,
            kill_rx,
            generation,
            alive.clone(),
            Arc::downgrade(&self.process),
            state.clone(),
        ));

        Ok(WorkerProcess {
            generation,
            stdin,
            alive,
            kill,
            watcher,
        })
    }

    /// Spawn the worker if needed and hand it the port. Returns the
    /// process's liveness flag.
    async fn handshake(
        &self,
        state: &Arc<RendererState>,
    ) -> Result<Arc<AtomicBool>, RendererError> {
        let mut slot = self.process.lock().await;
        let process = match slot.as_mut() {
            Some(process) => process,
            None => slot.insert(self.spawn(state)?),
        };
        let alive = process.alive.clone();

        match process.stdin.as_mut() {
            Some(stdin) => {
                debug!("handing port {} to worker", self.options.port);
                stdin
                    .write_all(format!("{}\n", self.options.port).as_bytes())
                    .await?;
                stdin.flush().await?;
            }
            None => {
                // The worker already took a port; ask it directly.
                drop(slot);
                self.channel.send(state, Endpoint::Ping, None).await?;
            }
        }
        Ok(alive)
    }

    /// The tracked process's liveness flag, if there is one.
    async fn liveness(&self) -> Option<Arc<AtomicBool>> {
        let slot = self.process.lock().await;
        slot.as_ref().map(|process| process.alive.clone())
    }

    async fn close_stdin(&self) {
        if let Some(process) = self.process.lock().await.as_mut() {
            process.stdin = None;
        }
    }

    /// Kill the tracked worker and wait for it to exit. Returns whether one
    /// was tracked.
    async fn stop_process(&self) -> bool {
        let Some(process) = self.process.lock().await.take() else {
            return false;
        };

        let _ = process.kill.send(());
        if let Err(err) = process.watcher.await {
            error!("worker exit watcher failed: {err}");
        }
        true
    }
}

#[async_trait]
impl Backend for WorkerBackend {
    fn name(&self) -> &'static str {
        "worker"
    }

    async fn boot(&self, state: &Arc<RendererState>) -> Result<(), RendererError> {
        if state.is_booted() {
            return Ok(());
        }

        let alive = if state.begin_boot()? {
            match self.handshake(state).await {
                Ok(alive) => Some(alive),
                Err(err) => {
                    let _ = state.transition(RendererTransition::BootAborted);
                    return Err(err);
                }
            }
        } else {
            self.liveness().await
        };
        let exited = || alive.as_ref().is_some_and(|alive| !alive.load(Ordering::SeqCst));

        // Ends early when the worker exits or reports a failed bind.
        let waited = wait_until(
            || state.is_booted() || !state.is_booting() || exited(),
            Some(self.options.boot_timeout),
        )
        .await;
        self.close_stdin().await;

        if state.is_booted() {
            info!("worker booted at {}", self.channel.base_url);
            return Ok(());
        }

        let err = match waited {
            Err(err) => err,
            Ok(()) => RendererError::Unreachable {
                url: self.channel.base_url.clone(),
                reason: if exited() {
                    "worker exited before booting".into()
                } else {
                    format!("worker could not listen on port {}", self.options.port)
                },
            },
        };
        warn!("worker did not boot: {err}");
        self.stop_process().await;
        let _ = state.transition(RendererTransition::BootAborted);
        Err(err)
    }

    async fn shutdown(&self, state: &Arc<RendererState>) -> Result<(), RendererError> {
        if !self.stop_process().await {
            debug!("no worker to stop");
        }
        state.transition(RendererTransition::Halted)?;
        Ok(())
    }

    async fn ping(&self, state: &Arc<RendererState>) -> Result<Vec<String>, RendererError> {
        match self.channel.send(state, Endpoint::Ping, None).await? {
            Reply::Body(body) => Ok(serde_json::from_str::<PingResponse>(&body)?.ids),
            Reply::Location(location) => Err(RendererError::UnexpectedResponse {
                url: format!("{}{}", self.channel.base_url, Endpoint::Ping.path()),
                status: 303,
                body: location,
            }),
        }
    }

    /// Completion is the worker's `did-load-page` record, not the HTTP reply.
    /// A failed request ends the wait early.
    async fn load_page(
        &self,
        state: &Arc<RendererState>,
        page: &Arc<Page>,
        mut options: LoadOptions,
    ) -> Result<(), RendererError> {
        if options.html.is_none() {
            options.url = Some(resolve_url(page.id(), options.url.as_deref())?);
        }
        let body = json_body(&LoadPageBody {
            id: page.id().to_string(),
            options,
        })?;

        page.transition(PageTransition::Loading)?;

        let failure = Arc::new(StdMutex::new(None));
        let request = {
            let channel = self.channel.clone();
            let state = state.clone();
            let failure = failure.clone();
            let id = page.id().to_string();
            async move {
                if let Err(err) = channel.send(&state, Endpoint::LoadPage, Some(body)).await {
                    warn!("loadPage {id:?} failed: {err}");
                    *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
                }
            }
        };
        tokio::spawn(request);

        let failed = || {
            failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
        };
        // Losing the worker or tearing the page down also ends the wait.
        let abandoned = || !state.is_booted() || page.is_destroying() || page.is_destroyed();
        wait_until(
            || page.is_loaded() || failed() || abandoned(),
            Some(self.options.load_timeout),
        )
        .await?;

        if page.is_loaded() {
            return Ok(());
        }
        if let Some(err) = failure.lock().unwrap_or_else(PoisonError::into_inner).take() {
            return Err(with_page_id(err, page));
        }
        if !state.is_booted() {
            return Err(RendererError::Unreachable {
                url: self.channel.base_url.clone(),
                reason: format!("worker went away while page {:?} was loading", page.id()),
            });
        }
        Err(RendererError::precondition(format!(
            "page {:?} was destroyed while loading",
            page.id()
        )))
    }

    async fn render_page(
        &self,
        state: &Arc<RendererState>,
        page: &Arc<Page>,
        options: RenderOptions,
    ) -> Result<RenderOutput, RendererError> {
        let body = json_body(&RenderPageBody {
            id: page.id().to_string(),
            options,
        })?;

        let reply = self
            .channel
            .send(state, Endpoint::RenderPage, Some(body))
            .await
            .map_err(|err| with_page_id(err, page))?;

        Ok(match reply {
            Reply::Body(content) => RenderOutput::Content(content),
            Reply::Location(path) => RenderOutput::File(PathBuf::from(path)),
        })
    }

    async fn unload_page(
        &self,
        state: &Arc<RendererState>,
        page: &Arc<Page>,
    ) -> Result<bool, RendererError> {
        let body = json_body(&PageRef {
            id: page.id().to_string(),
        })?;

        let reply = self
            .channel
            .send(state, Endpoint::UnloadPage, Some(body))
            .await
            .map_err(|err| with_page_id(err, page))?;

        Ok(matches!(reply, Reply::Body(body) if body.trim().is_empty()))
    }
}
