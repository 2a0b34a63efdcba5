/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Render web pages to HTML, PDF or images through an out-of-process worker.
//!
//! Provides two sides of one protocol:
//!
//! - **[`Renderer`]**: owns [`Page`]s and dispatches their commands to a
//!   [`Backend`]. The [`WorkerBackend`] spawns `render-vendor-worker`, hands
//!   it a port over stdin, sends commands over HTTP, and tracks boot and
//!   load completion from sentinel records on the worker's stdout.
//! - **[`worker`]**: the worker process itself, with its page registry, control API
//!   and the document engine behind it.
//!
//! # Example
//!
//! ```no_run
//! use render_vendor::{LoadOptions, Renderer, WorkerOptions};
//!
//! # async fn run() -> Result<(), render_vendor::RendererError> {
//! let renderer = Renderer::worker(WorkerOptions::default())?;
//! let page = renderer.load("https://example.com", LoadOptions::default()).await?;
//! let output = page.render("example.html").await?;
//! println!("{output:?}");
//! renderer.destroy().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Example (shared renderer)
//!
//! ```no_run
//! use render_vendor::{LoadOptions, RenderOptions, RenderVendor};
//!
//! # async fn run() -> Result<(), render_vendor::RendererError> {
//! let vendor = RenderVendor::default();
//! let page = vendor
//!     .default_renderer()?
//!     .load("invoice", LoadOptions::html("<h1>Invoice</h1>"))
//!     .await?;
//! let html = page.render(RenderOptions::format("html")).await?;
//! vendor.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod page;
mod renderer;
mod supervisor;
mod types;
mod vendor;
mod wait;

pub mod protocol;
pub mod worker;

pub use backend::{Backend, Command, CommandOutput, NullBackend};
pub use page::{Page, PageStatus, PageTransition};
pub use renderer::{Renderer, RendererState, RendererStatus, RendererTransition};
pub use supervisor::WorkerBackend;
pub use types::{
    LoadOptions, PaperSize, RenderOptions, RenderOutput, RendererError, RendererEvent,
    ViewportSize, WORKER_BIN, WORKER_ENV, WorkerOptions,
};
pub use vendor::{BASE_PORT, RenderVendor};
pub use wait::{POLL_INTERVAL, wait_until};
