// Copyright 2024-Present the Janus authors.
// SPDX-License-Identifier: Apache-2.0

use std::io;

/// Errors surfaced by the forwarding pipeline.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("error reading from {addr}: {source}")]
    Read {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("proxy is closed")]
    ProxyClosed,

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("gateway requires at least one listen address")]
    NoListeners,

    #[error("listener task failed: {0}")]
    Task(String),
}
