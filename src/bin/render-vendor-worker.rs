/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The worker process spawned by a render-vendor supervisor.
//!
//! Reads its port from stdin, then serves the control API. Log records go to
//! stdout alongside the sentinel records; stderr is left for crashes.
//!
//! ```bash
//! echo 8180 | render-vendor-worker --converter wkhtmltopdf
//! ```

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use bpaf::Bpaf;
use env_logger::{Env, Target};
use log::error;
use render_vendor::worker::engine::{Converter, SnapshotEngine};
use render_vendor::worker::{self, StdoutSink, WorkerError, WorkerState};
use tokio::io::BufReader;

// ---------------------------------------------------------------------------
// CLI parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Bpaf)]
#[bpaf(options, usage("render-vendor-worker [OPTIONS] < PORT"))]
struct WorkerConfig {
    /// Interface to listen on
    #[bpaf(long, argument("HOST"), fallback(String::from("localhost")))]
    host: String,

    /// Program converting html snapshots to other formats
    #[bpaf(long, argument("PATH"))]
    converter: Option<PathBuf>,

    /// Argument passed to the converter ahead of the input and output paths
    #[bpaf(long("converter-arg"), argument("ARG"), many)]
    converter_args: Vec<String>,

    /// Directory for renders that name no output file
    #[bpaf(long("output-dir"), argument("DIR"))]
    output_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

async fn run(config: WorkerConfig) -> Result<(), WorkerError> {
    let mut engine = SnapshotEngine::new()?;
    if let Some(program) = config.converter {
        engine = engine.with_converter(Converter {
            program,
            args: config.converter_args,
        });
    }

    let output_dir = config
        .output_dir
        .unwrap_or_else(WorkerState::default_output_dir);
    let state = WorkerState::new(Arc::new(engine), Arc::new(StdoutSink), output_dir);

    let stdin = BufReader::new(tokio::io::stdin());
    let listener = worker::boot(&state, &config.host, stdin).await?;
    worker::serve(listener, state).await
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(Target::Stdout)
        .init();

    let config = worker_config().run();

    if let Err(e) = run(config).await {
        error!("worker failed: {e}");
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
