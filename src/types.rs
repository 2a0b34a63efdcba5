/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Shared public types used across all layers.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Binary name of the worker process.
pub const WORKER_BIN: &str = "render-vendor-worker";

/// Environment variable overriding the worker binary location.
pub const WORKER_ENV: &str = "RENDER_VENDOR_WORKER";

/// Options for configuring an out-of-process renderer.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Host the worker's control server listens on (default: `localhost`).
    pub host: String,
    /// Port handed to the worker during the boot handshake (default: 8180).
    pub port: u16,
    /// Worker executable.
    pub program: PathBuf,
    /// Extra arguments passed to the worker executable.
    pub args: Vec<String>,
    /// Maximum time to wait for the worker to report boot (default: 30s).
    pub boot_timeout: Duration,
    /// Maximum time to wait for a page load to be reported (default: 30s).
    pub load_timeout: Duration,
}

impl WorkerOptions {
    pub const DEFAULT_HOST: &'static str = "localhost";
    pub const DEFAULT_PORT: u16 = 8180;

    /// Base URL of the worker's control server.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            host: Self::DEFAULT_HOST.to_string(),
            port: Self::DEFAULT_PORT,
            program: default_worker_program(),
            args: Vec::new(),
            boot_timeout: Duration::from_secs(30),
            load_timeout: Duration::from_secs(30),
        }
    }
}

/// `RENDER_VENDOR_WORKER`, else the worker binary next to the current executable.
fn default_worker_program() -> PathBuf {
    if let Some(path) = env::var_os(WORKER_ENV) {
        return PathBuf::from(path);
    }

    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BIN)))
        .unwrap_or_else(|| PathBuf::from(WORKER_BIN))
}

/// Viewport dimensions in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportSize {
    pub width: u32,
    pub height: u32,
}

/// Options for loading a page. Either `html` or `url` selects the document;
/// with neither, the page id itself is used as the URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_size: Option<ViewportSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpi: Option<u32>,
    /// Engine-specific options passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LoadOptions {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn html(html: impl Into<String>) -> Self {
        Self {
            html: Some(html.into()),
            ..Self::default()
        }
    }
}

/// Paper geometry for paged output formats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaperSize {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin: Option<String>,
}

/// Options for rendering a loaded page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOptions {
    /// Output file. Without one, paged/image formats go to a worker temp file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<PathBuf>,
    /// Output format (`html`, `pdf`, `png`, ...). Inferred from `filename` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paper_size: Option<PaperSize>,
    /// Engine-specific options passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RenderOptions {
    pub fn format(format: impl Into<String>) -> Self {
        Self {
            format: Some(format.into()),
            ..Self::default()
        }
    }

    /// Fill in `format` from the filename's extension. An explicit format
    /// always wins; an empty extension leaves the format unset.
    pub fn infer_format(&mut self) {
        if self.format.is_some() {
            return;
        }

        let extension = self
            .filename
            .as_deref()
            .and_then(Path::extension)
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty());

        if let Some(ext) = extension {
            self.format = Some(ext.to_string());
        }
    }
}

impl From<&str> for RenderOptions {
    fn from(filename: &str) -> Self {
        PathBuf::from(filename).into()
    }
}

impl From<String> for RenderOptions {
    fn from(filename: String) -> Self {
        PathBuf::from(filename).into()
    }
}

impl From<&Path> for RenderOptions {
    fn from(filename: &Path) -> Self {
        filename.to_path_buf().into()
    }
}

impl From<PathBuf> for RenderOptions {
    fn from(filename: PathBuf) -> Self {
        Self {
            filename: Some(filename),
            ..Self::default()
        }
    }
}

/// Result of a render: a file written by the backend, or raw content.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderOutput {
    File(PathBuf),
    Content(String),
}

/// Asynchronous notifications published by a renderer.
#[derive(Debug, Clone, PartialEq)]
pub enum RendererEvent {
    /// Informational output from the backend.
    Message(String),
    /// Error output from the backend.
    Error(String),
    /// The worker process exited with the given status code.
    WorkerExited(Option<i32>),
}

/// Errors that can occur during renderer and page operations.
#[derive(Debug, thiserror::Error)]
pub enum RendererError {
    /// Invalid argument or illegal state transition.
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),
    /// A bounded wait exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Control-channel response outside the recognized status ranges.
    #[error("unexpected response: HTTP {status} - {url}: {body}")]
    UnexpectedResponse {
        url: String,
        status: u16,
        body: String,
    },
    /// The control channel could not be reached (worker crashed or not listening).
    #[error("worker unreachable at {url}: {reason}")]
    Unreachable { url: String, reason: String },
    /// The worker does not know the page.
    #[error("page not found: {0}")]
    PageNotFound(String),
    /// Abstract backend operation invoked on a backend that does not provide it.
    #[error("operation not implemented: {0}")]
    NotImplemented(&'static str),
    /// The worker process could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
    /// The HTTP client could not be set up.
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RendererError {
    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        RendererError::PreconditionViolation(message.into())
    }

    /// Operational failures a caller may retry; programmer errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RendererError::Timeout(_)
                | RendererError::UnexpectedResponse { .. }
                | RendererError::Unreachable { .. }
                | RendererError::PageNotFound(_)
        )
    }
}
