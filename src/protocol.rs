/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Wire formats shared by the supervisor and the worker.
//!
//! Three channels connect the two processes:
//!
//! - stdin carries the boot handshake, a single `"<port>\n"` line.
//! - stdout carries [`Sentinel`] records, two lines each (token, then data),
//!   interleaved with ordinary log output.
//! - HTTP carries commands, one [`Endpoint`] per operation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{LoadOptions, RenderOptions};

/// Value of the `server` header on every worker response.
pub const SERVER_NAME: &str = "render-vendor";

/// Control endpoints exposed by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    LoadPage,
    RenderPage,
    UnloadPage,
    Ping,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::LoadPage => "/loadPage",
            Endpoint::RenderPage => "/renderPage",
            Endpoint::UnloadPage => "/unloadPage",
            Endpoint::Ping => "/ping",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Kinds of out-of-band status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelKind {
    WillBoot,
    DidBoot,
    WillLoadPage,
    DidLoadPage,
}

impl SentinelKind {
    const ALL: [SentinelKind; 4] = [
        SentinelKind::WillBoot,
        SentinelKind::DidBoot,
        SentinelKind::WillLoadPage,
        SentinelKind::DidLoadPage,
    ];

    pub fn token(self) -> &'static str {
        match self {
            SentinelKind::WillBoot => "will-boot",
            SentinelKind::DidBoot => "did-boot",
            SentinelKind::WillLoadPage => "will-load-page",
            SentinelKind::DidLoadPage => "did-load-page",
        }
    }

    pub fn from_token(line: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.token() == line)
    }
}

/// A status record: the kind, plus a page id or a boot outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinel {
    pub kind: SentinelKind,
    pub data: String,
}

impl Sentinel {
    pub fn new(kind: SentinelKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    pub fn will_boot() -> Self {
        Self::new(SentinelKind::WillBoot, "true")
    }

    pub fn did_boot(ok: bool) -> Self {
        Self::new(SentinelKind::DidBoot, ok.to_string())
    }

    pub fn will_load_page(id: &str) -> Self {
        Self::new(SentinelKind::WillLoadPage, id)
    }

    pub fn did_load_page(id: &str) -> Self {
        Self::new(SentinelKind::DidLoadPage, id)
    }

    /// Boot outcome carried by `did-boot`.
    pub fn flag(&self) -> bool {
        self.data == "true"
    }

    /// The record as written to stdout, trailing newline included.
    pub fn encode(&self) -> String {
        format!("{}\n{}\n", self.kind.token(), self.data)
    }
}

/// One decoded unit of worker stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdoutLine {
    Sentinel(Sentinel),
    Message(String),
}

/// Line-at-a-time decoder for worker stdout.
///
/// A token line is held until the following line arrives, which becomes its
/// data. Everything else passes through as a message.
#[derive(Debug, Default)]
pub struct SentinelDecoder {
    pending: Option<SentinelKind>,
}

impl SentinelDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line, without its terminator.
    pub fn feed(&mut self, line: &str) -> Option<StdoutLine> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(kind) = self.pending.take() {
            return Some(StdoutLine::Sentinel(Sentinel::new(kind, line)));
        }

        match SentinelKind::from_token(line) {
            Some(kind) => {
                self.pending = Some(kind);
                None
            }
            None => Some(StdoutLine::Message(line.to_string())),
        }
    }

    /// Flush at end of stream. A dangling token is reported as a message.
    pub fn finish(&mut self) -> Option<StdoutLine> {
        self.pending
            .take()
            .map(|kind| StdoutLine::Message(kind.token().to_string()))
    }
}

/// Body of `POST /loadPage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadPageBody {
    pub id: String,
    #[serde(flatten)]
    pub options: LoadOptions,
}

/// Body of `POST /renderPage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPageBody {
    pub id: String,
    #[serde(flatten)]
    pub options: RenderOptions,
}

/// Body of `POST /unloadPage`, and of the `/loadPage` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRef {
    pub id: String,
}

/// Body of the `/ping` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub ids: Vec<String>,
}
