/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Document engines the worker drives.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use log::{debug, info};
use percent_encoding::percent_decode_str;
use tokio::process::Command;
use url::Url;

use super::WorkerError;
use crate::types::{LoadOptions, PaperSize, ViewportSize};

/// Where a document comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentSource {
    Html(String),
    Url(Url),
}

/// Display settings a page was loaded with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadSettings {
    pub viewport_size: Option<ViewportSize>,
    pub zoom_factor: Option<f64>,
    pub dpi: Option<u32>,
}

impl From<&LoadOptions> for LoadSettings {
    fn from(options: &LoadOptions) -> Self {
        Self {
            viewport_size: options.viewport_size,
            zoom_factor: options.zoom_factor,
            dpi: options.dpi,
        }
    }
}

/// A loaded document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub url: Option<String>,
    pub html: String,
    pub settings: LoadSettings,
}

impl Document {
    /// The empty document a page holds before (or instead of) a load.
    pub fn blank(settings: LoadSettings) -> Self {
        Self {
            url: None,
            html: String::new(),
            settings,
        }
    }
}

/// One render-to-file job.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub path: PathBuf,
    pub format: String,
    pub quality: u8,
    pub paper_size: Option<PaperSize>,
}

/// The engine behind a worker: opens documents and renders them to files.
#[async_trait]
pub trait DocumentEngine: Send + Sync {
    async fn open(
        &self,
        source: DocumentSource,
        settings: &LoadSettings,
    ) -> Result<Document, WorkerError>;

    /// Write `document` to `request.path` in `request.format`.
    async fn render(
        &self,
        document: &Document,
        request: &RenderRequest,
    ) -> Result<(), WorkerError>;
}

// ---------------------------------------------------------------------------
// Internal: data: URLs
// ---------------------------------------------------------------------------

/// Decode the payload of a `data:` URL.
fn decode_data_url(url: &Url) -> Result<String, WorkerError> {
    let rest = url.as_str().strip_prefix("data:").unwrap_or_default();
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| WorkerError::LoadFailed(format!("malformed data URL: {url}")))?;

    let bytes: Vec<u8> = percent_decode_str(payload).collect();
    let bytes = if meta.ends_with(";base64") {
        let compact: Vec<u8> = bytes
            .into_iter()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        STANDARD
            .decode(compact)
            .map_err(|err| WorkerError::LoadFailed(format!("invalid base64 in data URL: {err}")))?
    } else {
        bytes
    };

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

// ---------------------------------------------------------------------------
// Public: SnapshotEngine
// ---------------------------------------------------------------------------

/// External program producing non-html formats.
///
/// Invoked as `<program> <args...> <input.html> <output>`, with the render
/// settings in `RENDER_VENDOR_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Converter {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Engine keeping a markup snapshot of each document.
///
/// Html output is the snapshot itself; every other format goes through the
/// configured [`Converter`].
pub struct SnapshotEngine {
    client: reqwest::Client,
    converter: Option<Converter>,
}

impl SnapshotEngine {
    pub fn new() -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| WorkerError::LoadFailed(format!("http client: {err}")))?;
        Ok(Self {
            client,
            converter: None,
        })
    }

    pub fn with_converter(mut self, converter: Converter) -> Self {
        self.converter = Some(converter);
        self
    }

    async fn fetch(&self, url: &Url) -> Result<String, WorkerError> {
        match url.scheme() {
            "http" | "https" => {
                let response = self
                    .client
                    .get(url.clone())
                    .send()
                    .await
                    .and_then(|response| response.error_for_status())
                    .map_err(|err| WorkerError::LoadFailed(err.to_string()))?;
                response
                    .text()
                    .await
                    .map_err(|err| WorkerError::LoadFailed(err.to_string()))
            }
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|()| WorkerError::LoadFailed(format!("not a file path: {url}")))?;
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|err| WorkerError::LoadFailed(format!("{}: {err}", path.display())))
            }
            "data" => decode_data_url(url),
            "about" if url.path() == "blank" => Ok(String::new()),
            scheme => Err(WorkerError::LoadFailed(format!(
                "unsupported URL scheme {scheme:?}"
            ))),
        }
    }
}

#[async_trait]
impl DocumentEngine for SnapshotEngine {
    async fn open(
        &self,
        source: DocumentSource,
        settings: &LoadSettings,
    ) -> Result<Document, WorkerError> {
        let (url, html) = match source {
            DocumentSource::Html(html) => (None, html),
            DocumentSource::Url(url) => {
                debug!("fetching {url}");
                let html = self.fetch(&url).await?;
                (Some(url.to_string()), html)
            }
        };

        Ok(Document {
            url,
            html,
            settings: settings.clone(),
        })
    }

    async fn render(
        &self,
        document: &Document,
        request: &RenderRequest,
    ) -> Result<(), WorkerError> {
        let converter = self
            .converter
            .as_ref()
            .ok_or_else(|| WorkerError::UnsupportedFormat(request.format.clone()))?;

        let mut input = tempfile::Builder::new()
            .prefix("render-vendor-")
            .suffix(".html")
            .tempfile()?;
        input.write_all(document.html.as_bytes())?;
        input.flush()?;

        let mut command = Command::new(&converter.program);
        command
            .args(&converter.args)
            .arg(input.path())
            .arg(&request.path)
            .env("RENDER_VENDOR_FORMAT", &request.format)
            .env("RENDER_VENDOR_QUALITY", request.quality.to_string())
            // Our stdout is the sentinel channel.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(url) = &document.url {
            command.env("RENDER_VENDOR_URL", url);
        }
        let settings = &document.settings;
        if let Some(ViewportSize { width, height }) = settings.viewport_size {
            command.env("RENDER_VENDOR_VIEWPORT", format!("{width}x{height}"));
        }
        if let Some(zoom) = settings.zoom_factor {
            command.env("RENDER_VENDOR_ZOOM", zoom.to_string());
        }
        if let Some(dpi) = settings.dpi {
            command.env("RENDER_VENDOR_DPI", dpi.to_string());
        }
        if let Some(paper) = &request.paper_size {
            let fields = [
                ("RENDER_VENDOR_PAPER_WIDTH", &paper.width),
                ("RENDER_VENDOR_PAPER_HEIGHT", &paper.height),
                ("RENDER_VENDOR_PAPER_FORMAT", &paper.format),
                ("RENDER_VENDOR_PAPER_ORIENTATION", &paper.orientation),
                ("RENDER_VENDOR_PAPER_MARGIN", &paper.margin),
            ];
            for (key, value) in fields {
                if let Some(value) = value {
                    command.env(key, value);
                }
            }
        }

        let output = command.output().await.map_err(|err| {
            WorkerError::RenderFailed(format!("{}: {err}", converter.program.display()))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkerError::RenderFailed(format!(
                "{} exited with {}: {}",
                converter.program.display(),
                output.status,
                stderr.trim()
            )));
        }

        info!(
            "converted {} snapshot to {}",
            request.format,
            request.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(url: &str) -> Result<String, WorkerError> {
        decode_data_url(&Url::parse(url).unwrap())
    }

    #[test]
    fn decodes_plain_data_urls() {
        assert_eq!(data("data:text/html,<h1>Hi</h1>").unwrap(), "<h1>Hi</h1>");
        assert_eq!(
            data("data:text/html,%3Cp%3Ea%20b%3C/p%3E").unwrap(),
            "<p>a b</p>"
        );
        assert_eq!(data("data:,100%").unwrap(), "100%");
        assert_eq!(data("data:,done%21").unwrap(), "done!");
    }

    #[test]
    fn decodes_base64_data_urls() {
        let encoded = STANDARD.encode("<h1>Base</h1>");
        let html = data(&format!("data:text/html;base64,{encoded}")).unwrap();
        assert_eq!(html, "<h1>Base</h1>");

        assert!(matches!(
            data("data:text/html;base64,@@@"),
            Err(WorkerError::LoadFailed(_))
        ));
    }

    #[tokio::test]
    async fn opens_markup_and_local_sources() {
        let engine = SnapshotEngine::new().unwrap();
        let settings = LoadSettings {
            dpi: Some(96),
            ..LoadSettings::default()
        };

        let doc = engine
            .open(DocumentSource::Html("<p>x</p>".into()), &settings)
            .await
            .unwrap();
        assert_eq!(doc.html, "<p>x</p>");
        assert_eq!(doc.url, None);
        assert_eq!(doc.settings.dpi, Some(96));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        std::fs::write(&path, "<p>file</p>").unwrap();
        let url = Url::from_file_path(&path).unwrap();
        let doc = engine
            .open(DocumentSource::Url(url), &settings)
            .await
            .unwrap();
        assert_eq!(doc.html, "<p>file</p>");

        let blank = Url::parse("about:blank").unwrap();
        let doc = engine
            .open(DocumentSource::Url(blank), &settings)
            .await
            .unwrap();
        assert!(doc.html.is_empty());
    }

    #[tokio::test]
    async fn unsupported_scheme_fails_load() {
        let engine = SnapshotEngine::new().unwrap();
        let url = Url::parse("ftp://example.com/a.html").unwrap();
        let err = engine
            .open(DocumentSource::Url(url), &LoadSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::LoadFailed(_)));
    }

    #[tokio::test]
    async fn render_without_converter_is_unsupported() {
        let engine = SnapshotEngine::new().unwrap();
        let request = RenderRequest {
            path: PathBuf::from("out.pdf"),
            format: "pdf".into(),
            quality: 75,
            paper_size: None,
        };
        let err = engine
            .render(&Document::default(), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::UnsupportedFormat(f) if f == "pdf"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn render_runs_converter_with_settings() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("convert.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\n{ cat \"$1\"; echo \"$RENDER_VENDOR_FORMAT $RENDER_VENDOR_QUALITY $RENDER_VENDOR_PAPER_FORMAT\"; } > \"$2\"\n",
        )
        .unwrap();

        let engine = SnapshotEngine::new().unwrap().with_converter(Converter {
            program: PathBuf::from("/bin/sh"),
            args: vec![script.to_string_lossy().into_owned()],
        });
        let request = RenderRequest {
            path: dir.path().join("out.pdf"),
            format: "pdf".into(),
            quality: 75,
            paper_size: Some(PaperSize {
                format: Some("A4".into()),
                ..PaperSize::default()
            }),
        };
        let document = Document {
            html: "<p>snap</p>\n".into(),
            ..Document::default()
        };

        engine.render(&document, &request).await.unwrap();
        let written = std::fs::read_to_string(&request.path).unwrap();
        assert_eq!(written, "<p>snap</p>\npdf 75 A4\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_converter_reports_stderr() {
        let engine = SnapshotEngine::new().unwrap().with_converter(Converter {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), "echo broken >&2; exit 3".into()],
        });
        let request = RenderRequest {
            path: PathBuf::from("out.png"),
            format: "png".into(),
            quality: 75,
            paper_size: None,
        };

        let err = engine
            .render(&Document::default(), &request)
            .await
            .unwrap_err();
        match err {
            WorkerError::RenderFailed(message) => assert!(message.contains("broken")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
