/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Render one page through a render-vendor worker.
//!
//! Thin wrapper around [`render_vendor::Renderer`].
//!
//! ```bash
//! render-vendor https://example.com                      # html to stdout
//! render-vendor --output page.html https://example.com
//! render-vendor --html invoice.html --output invoice.pdf \
//!     --worker-arg=--converter --worker-arg=wkhtmltopdf
//! ```

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use bpaf::Bpaf;
use env_logger::Env;
use log::{error, info, warn};
use render_vendor::{
    LoadOptions, RenderOptions, RenderOutput, Renderer, RendererError, WorkerOptions,
};

// ---------------------------------------------------------------------------
// CLI parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Bpaf)]
#[bpaf(options, usage("render-vendor [OPTIONS] (--html FILE | <URL>)"))]
struct RenderConfig {
    /// Render the markup in this file instead of a URL
    #[bpaf(long, argument("FILE"))]
    html: Option<PathBuf>,

    /// Output file; its extension picks the format unless --format is given
    #[bpaf(long, short, argument("PATH"))]
    output: Option<PathBuf>,

    /// Output format (html, pdf, png, ...)
    #[bpaf(long, short, argument("FORMAT"))]
    format: Option<String>,

    /// Port handed to the worker
    #[bpaf(long, argument("PORT"), fallback(WorkerOptions::DEFAULT_PORT))]
    port: u16,

    /// Worker executable
    #[bpaf(long, argument("PATH"))]
    worker: Option<PathBuf>,

    /// Extra argument for the worker, e.g. --worker-arg=--converter
    #[bpaf(long("worker-arg"), argument("ARG"), many)]
    worker_args: Vec<String>,

    /// Maximum time to wait for boot and for the page load
    #[bpaf(long, argument("SECONDS"), fallback(30u64))]
    timeout: u64,

    /// URL to load
    #[bpaf(positional("URL"))]
    url: Option<String>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

/// Page id and load options for the configured source.
fn source(config: &RenderConfig) -> Result<(String, LoadOptions), String> {
    match (&config.html, &config.url) {
        (Some(path), None) => {
            let html = std::fs::read_to_string(path)
                .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
            Ok((path.display().to_string(), LoadOptions::html(html)))
        }
        (None, Some(url)) => Ok((url.clone(), LoadOptions::default())),
        _ => Err("exactly one of --html or a URL must be specified".into()),
    }
}

async fn render(
    renderer: &Renderer,
    id: &str,
    load: LoadOptions,
    options: RenderOptions,
) -> Result<RenderOutput, RendererError> {
    let page = renderer.load(id, load).await?;
    info!("loaded {id}");
    page.render(options).await
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    let config = render_config().run();

    let (id, load) = source(&config).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        process::exit(1);
    });

    let timeout = Duration::from_secs(config.timeout);
    let mut options = WorkerOptions {
        port: config.port,
        args: config.worker_args.clone(),
        boot_timeout: timeout,
        load_timeout: timeout,
        ..WorkerOptions::default()
    };
    if let Some(worker) = &config.worker {
        options.program = worker.clone();
    }

    let renderer = Renderer::worker(options).unwrap_or_else(|e| {
        eprintln!("Error: failed to set up renderer: {e}");
        process::exit(1);
    });

    let render_options = RenderOptions {
        filename: config.output.clone(),
        format: config.format.clone(),
        ..RenderOptions::default()
    };
    let result = render(&renderer, &id, load, render_options).await;

    if let Err(e) = renderer.destroy().await {
        warn!("failed to stop worker: {e}");
    }

    // Html comes back inline even when an output file was named.
    let result = match (result, &config.output) {
        (Ok(RenderOutput::Content(html)), Some(path)) => std::fs::write(path, html)
            .map(|()| RenderOutput::File(path.clone()))
            .map_err(RendererError::Io),
        (result, _) => result,
    };

    match result {
        Ok(RenderOutput::Content(html)) => print!("{html}"),
        Ok(RenderOutput::File(path)) => {
            eprintln!("Saved to {}", path.display());
            println!("{}", path.display());
        }
        Err(e) => {
            error!("render of {id} failed: {e}");
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
