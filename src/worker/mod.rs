/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Worker side of the protocol: the process a [`WorkerBackend`] spawns.
//!
//! The worker reads its port from stdin, serves the control API on it, and
//! reports boot and load progress as sentinel records on stdout. Page loads
//! run in the background; the HTTP reply to `/loadPage` only acknowledges
//! that a load started.
//!
//! [`WorkerBackend`]: crate::WorkerBackend

pub mod engine;

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, Uri, header};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::net::TcpListener;
use url::Url;

use self::engine::{Document, DocumentEngine, DocumentSource, LoadSettings, RenderRequest};
use crate::protocol::{
    Endpoint, LoadPageBody, PageRef, PingResponse, RenderPageBody, SERVER_NAME, Sentinel,
};

/// Quality passed to the engine when a render does not set one.
pub const DEFAULT_QUALITY: u8 = 75;

/// Format used when a render does not name one.
pub const DEFAULT_FORMAT: &str = "html";

/// Errors raised while serving a control request.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("page not found: {0}")]
    PageNotFound(String),
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("load failed: {0}")]
    LoadFailed(String),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("render failed: {0}")]
    RenderFailed(String),
    /// Stdin ended before a usable port arrived.
    #[error("input closed before the worker booted")]
    NoPort,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl WorkerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            WorkerError::PageNotFound(_) | WorkerError::UnknownMethod(_) => StatusCode::NOT_FOUND,
            WorkerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WorkerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("{self}");
        } else {
            debug!("{self}");
        }
        (status, self.to_string()).into_response()
    }
}

/// Destination of sentinel records.
pub trait SentinelSink: Send + Sync {
    fn emit(&self, sentinel: &Sentinel);
}

/// Writes each record to stdout in one locked write, so log lines never
/// split a record.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl SentinelSink for StdoutSink {
    fn emit(&self, sentinel: &Sentinel) {
        let mut stdout = io::stdout().lock();
        let written = stdout
            .write_all(sentinel.encode().as_bytes())
            .and_then(|()| stdout.flush());
        if let Err(err) = written {
            error!("failed to write {}: {err}", sentinel.kind.token());
        }
    }
}

struct WorkerPage {
    id: String,
    document: Document,
    /// Bumped on every load; a finishing load only lands if still current.
    generation: u64,
}

/// The worker's page registry and collaborators.
pub struct WorkerState {
    pages: Mutex<Vec<WorkerPage>>,
    engine: Arc<dyn DocumentEngine>,
    sink: Arc<dyn SentinelSink>,
    output_dir: PathBuf,
    generations: AtomicU64,
}

impl WorkerState {
    pub fn new(
        engine: Arc<dyn DocumentEngine>,
        sink: Arc<dyn SentinelSink>,
        output_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(Vec::new()),
            engine,
            sink,
            output_dir,
            generations: AtomicU64::new(0),
        })
    }

    /// `<tmp>/render-vendor-<pid>`, where renders without a filename go.
    pub fn default_output_dir() -> PathBuf {
        std::env::temp_dir().join(format!("render-vendor-{}", std::process::id()))
    }

    fn pages(&self) -> MutexGuard<'_, Vec<WorkerPage>> {
        self.pages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ids(&self) -> Vec<String> {
        self.pages().iter().map(|page| page.id.clone()).collect()
    }

    /// Find or create the page `id` and start a new load generation for it.
    /// Returns whether the page was created.
    fn begin_load(&self, id: &str, settings: &LoadSettings) -> (bool, u64) {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let mut pages = self.pages();
        match pages.iter_mut().find(|page| page.id == id) {
            Some(page) => {
                page.generation = generation;
                (false, generation)
            }
            None => {
                pages.push(WorkerPage {
                    id: id.to_string(),
                    document: Document::blank(settings.clone()),
                    generation,
                });
                (true, generation)
            }
        }
    }

    /// Store a loaded document unless the page was unloaded or reloaded
    /// meanwhile. Returns whether it was stored.
    fn finish_load(&self, id: &str, generation: u64, document: Document) -> bool {
        let mut pages = self.pages();
        match pages
            .iter_mut()
            .find(|page| page.id == id && page.generation == generation)
        {
            Some(page) => {
                page.document = document;
                true
            }
            None => false,
        }
    }

    fn document(&self, id: &str) -> Option<Document> {
        self.pages()
            .iter()
            .find(|page| page.id == id)
            .map(|page| page.document.clone())
    }

    fn remove(&self, id: &str) -> bool {
        let mut pages = self.pages();
        let before = pages.len();
        pages.retain(|page| page.id != id);
        pages.len() != before
    }

    fn output_path(&self, format: &str) -> PathBuf {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        self.output_dir.join(format!("{millis}.{format}"))
    }
}

fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T, WorkerError> {
    let body = if body.trim().is_empty() { "{}" } else { body };
    serde_json::from_str(body).map_err(|err| WorkerError::InvalidRequest(err.to_string()))
}

async fn run_load(
    state: Arc<WorkerState>,
    id: String,
    generation: u64,
    source: DocumentSource,
    settings: LoadSettings,
) {
    let document = match state.engine.open(source, &settings).await {
        Ok(document) => {
            info!("loaded page {id:?}");
            document
        }
        Err(err) => {
            // Load finished, unsuccessfully; the page keeps an empty document.
            error!("failed to load page {id:?}: {err}");
            Document::blank(settings)
        }
    };

    if state.finish_load(&id, generation, document) {
        state.sink.emit(&Sentinel::did_load_page(&id));
    } else {
        debug!("discarding superseded load of page {id:?}");
    }
}

async fn load_page(
    State(state): State<Arc<WorkerState>>,
    body: String,
) -> Result<Response, WorkerError> {
    let LoadPageBody { id, options } = parse_body(&body)?;
    let settings = LoadSettings::from(&options);

    let source = match (options.html, options.url) {
        (Some(html), _) => DocumentSource::Html(html),
        (None, Some(url)) => DocumentSource::Url(
            Url::parse(&url).map_err(|err| WorkerError::InvalidRequest(format!("{url}: {err}")))?,
        ),
        (None, None) => {
            return Err(WorkerError::InvalidRequest(
                "loadPage needs a url or html".into(),
            ));
        }
    };

    let (created, generation) = state.begin_load(&id, &settings);
    state.sink.emit(&Sentinel::will_load_page(&id));
    tokio::spawn(run_load(
        state.clone(),
        id.clone(),
        generation,
        source,
        settings,
    ));

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(PageRef { id })).into_response())
}

async fn render_page(
    State(state): State<Arc<WorkerState>>,
    body: String,
) -> Result<Response, WorkerError> {
    let RenderPageBody { id, options } = parse_body(&body)?;
    let document = state
        .document(&id)
        .ok_or_else(|| WorkerError::PageNotFound(id.clone()))?;

    let format = options
        .format
        .as_deref()
        .unwrap_or(DEFAULT_FORMAT)
        .to_ascii_lowercase();

    // Html is always answered inline; a filename only matters for other
    // formats.
    if format == DEFAULT_FORMAT {
        let content_type = [(header::CONTENT_TYPE, "text/html; charset=utf-8")];
        return Ok((content_type, document.html).into_response());
    }

    let path = match options.filename {
        Some(path) => path,
        None => state.output_path(&format),
    };
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let request = RenderRequest {
        path: path.clone(),
        format,
        quality: options.quality.unwrap_or(DEFAULT_QUALITY),
        paper_size: options.paper_size,
    };
    state.engine.render(&document, &request).await?;

    info!("rendered page {id:?} to {}", path.display());
    let location = path.to_string_lossy().into_owned();
    Ok((StatusCode::SEE_OTHER, [(header::LOCATION, location)]).into_response())
}

async fn unload_page(
    State(state): State<Arc<WorkerState>>,
    body: String,
) -> Result<StatusCode, WorkerError> {
    let PageRef { id } = parse_body(&body)?;
    if !state.remove(&id) {
        return Err(WorkerError::PageNotFound(id));
    }
    info!("unloaded page {id:?}");
    Ok(StatusCode::NO_CONTENT)
}

async fn ping(State(state): State<Arc<WorkerState>>) -> Json<PingResponse> {
    Json(PingResponse { ids: state.ids() })
}

async fn unknown_method(uri: Uri) -> WorkerError {
    WorkerError::UnknownMethod(uri.path().to_string())
}

async fn stamp_server(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
    response
}

/// The control API. Every response, errors included, carries the
/// `server: render-vendor` header.
pub fn router(state: Arc<WorkerState>) -> Router {
    Router::new()
        .route(Endpoint::LoadPage.path(), post(load_page))
        .route(Endpoint::RenderPage.path(), post(render_page))
        .route(Endpoint::UnloadPage.path(), post(unload_page))
        .route(Endpoint::Ping.path(), get(ping).post(ping))
        .fallback(unknown_method)
        .layer(middleware::map_response(stamp_server))
        .with_state(state)
}

/// Read port lines from `input` until one can be bound on `host`.
///
/// Each attempt is bracketed by `will-boot` and `did-boot` records. Lines
/// that are not port numbers are skipped.
pub async fn boot<R>(
    state: &WorkerState,
    host: &str,
    input: R,
) -> Result<TcpListener, WorkerError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let port: u16 = match line.parse() {
            Ok(port) => port,
            Err(_) => {
                warn!("ignoring invalid port {line:?}");
                continue;
            }
        };

        state.sink.emit(&Sentinel::will_boot());
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                info!("listening on {host}:{port}");
                state.sink.emit(&Sentinel::did_boot(true));
                return Ok(listener);
            }
            Err(err) => {
                error!("failed to listen on {host}:{port}: {err}");
                state.sink.emit(&Sentinel::did_boot(false));
            }
        }
    }

    Err(WorkerError::NoPort)
}

/// Serve the control API until the process is killed.
pub async fn serve(listener: TcpListener, state: Arc<WorkerState>) -> Result<(), WorkerError> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::protocol::SentinelKind;
    use crate::wait::wait_until;
    use engine::SnapshotEngine;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<Sentinel>>);

    impl RecordingSink {
        fn records(&self) -> Vec<Sentinel> {
            self.0.lock().unwrap().clone()
        }

        fn saw(&self, sentinel: &Sentinel) -> bool {
            self.0.lock().unwrap().contains(sentinel)
        }
    }

    impl SentinelSink for RecordingSink {
        fn emit(&self, sentinel: &Sentinel) {
            self.0.lock().unwrap().push(sentinel.clone());
        }
    }

    fn worker(output_dir: PathBuf) -> (Router, Arc<WorkerState>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let state = WorkerState::new(
            Arc::new(SnapshotEngine::new().unwrap()),
            sink.clone(),
            output_dir,
        );
        (router(state.clone()), state, sink)
    }

    async fn call(
        app: &Router,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Response {
        let body = match body {
            Some(json) => Body::from(json.to_string()),
            None => Body::empty(),
        };
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .expect("request should build");
        app.clone().oneshot(request).await.expect("router should respond")
    }

    async fn text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn loaded(sink: &RecordingSink, id: &str) {
        let done = Sentinel::did_load_page(id);
        wait_until(|| sink.saw(&done), Some(Duration::from_secs(5)))
            .await
            .unwrap();
    }

    fn stamped(response: &Response) -> bool {
        response.headers().get(header::SERVER).is_some_and(|v| v == SERVER_NAME)
    }

    #[tokio::test]
    async fn load_creates_then_reuses_pages() {
        let dir = tempfile::tempdir().unwrap();
        let (app, state, sink) = worker(dir.path().to_path_buf());
        let body = json!({"id": "a", "html": "<p>a</p>"});

        let response = call(&app, Method::POST, "/loadPage", Some(body.clone())).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(stamped(&response));
        assert_eq!(text(response).await, r#"{"id":"a"}"#);

        loaded(&sink, "a").await;
        let response = call(&app, Method::POST, "/loadPage", Some(body)).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        assert_eq!(state.ids(), ["a"]);
        let kinds: Vec<_> = sink.records().iter().map(|s| s.kind).collect();
        assert_eq!(kinds[..2], [SentinelKind::WillLoadPage, SentinelKind::DidLoadPage]);
    }

    #[tokio::test]
    async fn load_rejects_bad_requests() {
        let dir = tempfile::tempdir().unwrap();
        let (app, state, _) = worker(dir.path().to_path_buf());

        let response = call(&app, Method::POST, "/loadPage", Some(json!({"id": "a"}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(stamped(&response));

        let body = json!({"html": "<p></p>"});
        let response = call(&app, Method::POST, "/loadPage", Some(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert!(state.ids().is_empty());
    }

    #[tokio::test]
    async fn failed_load_still_reports_completion() {
        let dir = tempfile::tempdir().unwrap();
        let (app, state, sink) = worker(dir.path().to_path_buf());
        let missing = Url::from_file_path(dir.path().join("missing.html")).unwrap();

        let body = json!({"id": "broken", "url": missing.as_str()});
        let response = call(&app, Method::POST, "/loadPage", Some(body)).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        loaded(&sink, "broken").await;
        assert_eq!(state.document("broken").unwrap().html, "");
    }

    #[tokio::test]
    async fn renders_html_inline_even_with_filename() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _, sink) = worker(dir.path().join("out"));
        let body = json!({"id": "doc", "url": "data:text/html,<h1>Doc</h1>"});
        call(&app, Method::POST, "/loadPage", Some(body)).await;
        loaded(&sink, "doc").await;

        let response = call(&app, Method::POST, "/renderPage", Some(json!({"id": "doc"}))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
        assert_eq!(text(response).await, "<h1>Doc</h1>");

        let target = dir.path().join("doc.html");
        let body = json!({"id": "doc", "format": "html", "filename": target});
        let response = call(&app, Method::POST, "/renderPage", Some(body)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::LOCATION).is_none());
        assert_eq!(text(response).await, "<h1>Doc</h1>");
        assert!(!target.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn converted_formats_answer_with_location() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SnapshotEngine::new().unwrap().with_converter(engine::Converter {
            program: PathBuf::from("cp"),
            args: Vec::new(),
        });
        let sink = Arc::new(RecordingSink::default());
        let state = WorkerState::new(Arc::new(engine), sink.clone(), dir.path().join("out"));
        let app = router(state);
        let body = json!({"id": "a", "html": "<p>a</p>"});
        call(&app, Method::POST, "/loadPage", Some(body)).await;
        loaded(&sink, "a").await;

        let target = dir.path().join("a.png");
        let body = json!({"id": "a", "format": "png", "filename": target});
        let response = call(&app, Method::POST, "/renderPage", Some(body)).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], target.to_str().unwrap());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "<p>a</p>");

        let body = json!({"id": "a", "format": "png"});
        let response = call(&app, Method::POST, "/renderPage", Some(body)).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = PathBuf::from(response.headers()[header::LOCATION].to_str().unwrap());
        assert!(location.starts_with(dir.path().join("out")));
        assert_eq!(location.extension().unwrap(), "png");
        assert_eq!(std::fs::read_to_string(&location).unwrap(), "<p>a</p>");
    }

    #[tokio::test]
    async fn non_html_format_needs_a_converter() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _, sink) = worker(dir.path().to_path_buf());
        call(&app, Method::POST, "/loadPage", Some(json!({"id": "a", "html": "x"}))).await;
        loaded(&sink, "a").await;

        let body = json!({"id": "a", "format": "pdf"});
        let response = call(&app, Method::POST, "/renderPage", Some(body)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(stamped(&response));
        assert_eq!(text(response).await, "unsupported format: pdf");
    }

    #[tokio::test]
    async fn unknown_pages_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _, _) = worker(dir.path().to_path_buf());

        for path in ["/renderPage", "/unloadPage"] {
            let response = call(&app, Method::POST, path, Some(json!({"id": "nope"}))).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
            assert!(stamped(&response));
            assert_eq!(text(response).await, "page not found: nope");
        }
    }

    #[tokio::test]
    async fn unload_removes_page_and_ping_lists_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _, sink) = worker(dir.path().to_path_buf());
        for id in ["a", "b"] {
            call(&app, Method::POST, "/loadPage", Some(json!({"id": id, "html": id}))).await;
            loaded(&sink, id).await;
        }

        let response = call(&app, Method::GET, "/ping", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(stamped(&response));
        assert_eq!(text(response).await, r#"{"ids":["a","b"]}"#);

        let response = call(&app, Method::POST, "/unloadPage", Some(json!({"id": "a"}))).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(text(response).await.is_empty());

        let response = call(&app, Method::POST, "/ping", None).await;
        assert_eq!(text(response).await, r#"{"ids":["b"]}"#);
    }

    #[tokio::test]
    async fn unknown_method_is_stamped_404() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _, _) = worker(dir.path().to_path_buf());

        let response = call(&app, Method::POST, "/reticulateSplines", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(stamped(&response));
        assert_eq!(text(response).await, "unknown method: /reticulateSplines");
    }

    #[test]
    fn error_status_codes() {
        assert_eq!(
            WorkerError::PageNotFound("a".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            WorkerError::InvalidRequest("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            WorkerError::RenderFailed("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn boot_skips_bad_lines_and_retries_busy_ports() {
        let dir = tempfile::tempdir().unwrap();
        let (_, state, sink) = worker(dir.path().to_path_buf());

        let busy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let busy_port = busy.local_addr().unwrap().port();
        let free_port = {
            let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
            spare.local_addr().unwrap().port()
        };

        let input = format!("not-a-port\n\n{busy_port}\n{free_port}\n");
        let listener = boot(&state, "127.0.0.1", input.as_bytes()).await.unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), free_port);

        assert_eq!(
            sink.records(),
            [
                Sentinel::will_boot(),
                Sentinel::did_boot(false),
                Sentinel::will_boot(),
                Sentinel::did_boot(true),
            ]
        );
    }

    #[tokio::test]
    async fn boot_fails_when_input_ends() {
        let dir = tempfile::tempdir().unwrap();
        let (_, state, sink) = worker(dir.path().to_path_buf());

        let err = boot(&state, "127.0.0.1", &b"junk\n"[..]).await.unwrap_err();
        assert!(matches!(err, WorkerError::NoPort));
        assert!(sink.records().is_empty());
    }
}
