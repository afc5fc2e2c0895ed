// Copyright 2024-Present the Janus authors.
// SPDX-License-Identifier: Apache-2.0

//! Janus forwarding pipeline.
//!
//! UDP datagrams flow in through [`Porthole`] listeners, coalesce into
//! newline-separated batches inside a [`Proxy`], and leave as HTTP POSTs to
//! a remote intake endpoint. A [`Gateway`] couples one proxy to its
//! listeners under a shared cancellation scope; the [`RequestLimit`] caps
//! concurrent outbound requests across every gateway in the process.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod addr;
pub mod backoff;
pub mod error;
pub mod gateway;
pub mod limit;
pub mod porthole;
pub mod proxy;

pub use addr::{AddrError, ListenAddr, Network};
pub use backoff::Backoff;
pub use error::GatewayError;
pub use gateway::{Gateway, PortConfig};
pub use limit::RequestLimit;
pub use porthole::Porthole;
pub use proxy::Proxy;
