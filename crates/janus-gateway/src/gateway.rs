// Copyright 2024-Present the Janus authors.
// SPDX-License-Identifier: Apache-2.0

//! One forwarding gateway: a batching proxy plus its UDP listeners.

use std::fmt;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::addr::ListenAddr;
use crate::backoff::Backoff;
use crate::error::GatewayError;
use crate::limit::RequestLimit;
use crate::porthole::Porthole;
use crate::proxy::Proxy;

/// Runtime configuration for one gateway.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// UDP endpoints to listen on.
    pub listen: Vec<ListenAddr>,
    /// HTTP(S) destination for batched payloads.
    pub forward: Url,
    /// Cadence of timer-driven flushes.
    pub flush_interval: Duration,
    /// Batch size threshold in bytes.
    pub flush_size: usize,
    /// Per-read deadline on the UDP sockets; zero disables the deadline.
    pub read_timeout: Duration,
    /// Per-request timeout on outbound POSTs; zero disables the timeout.
    pub write_timeout: Duration,
    /// Retry budget for a failed dispatch.
    pub max_retries: u32,
    /// Delay schedule between dispatch retries.
    pub backoff: Backoff,
}

impl PortConfig {
    pub fn new(listen: Vec<ListenAddr>, forward: Url) -> PortConfig {
        PortConfig {
            listen,
            forward,
            flush_interval: Duration::from_secs(5),
            flush_size: 16_000,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(15),
            max_retries: 10,
            backoff: Backoff::default(),
        }
    }
}

/// One proxy coupled to its portholes under a shared cancellation scope.
#[derive(Debug)]
pub struct Gateway {
    config: PortConfig,
    proxy: Proxy,
    portholes: Vec<Porthole>,
}

impl Gateway {
    /// Builds a gateway from the given configuration.
    ///
    /// The configuration is copied, so later changes to the caller's value
    /// cannot reach a running gateway.
    pub fn new(config: &PortConfig, limit: RequestLimit) -> Result<Gateway, GatewayError> {
        if config.listen.is_empty() {
            return Err(GatewayError::NoListeners);
        }
        let config = config.clone();

        let proxy = Proxy::new(&config, limit)?;
        let portholes = config
            .listen
            .iter()
            .map(|addr| Porthole::new(addr.clone(), proxy.clone(), config.read_timeout))
            .collect();

        Ok(Gateway {
            config,
            proxy,
            portholes,
        })
    }

    /// Runs the gateway until cancellation or the first listener failure.
    ///
    /// All listeners and the proxy run under a child scope of `cancel`;
    /// whichever way this returns, the scope is cancelled so every sibling
    /// task observes termination, and the proxy is given the chance to
    /// drain its pending batches before the call completes.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), GatewayError> {
        let scope = cancel.child_token();
        let proxy_task = self.proxy.start(scope.clone(), self.config.flush_interval);

        let mut listeners = JoinSet::new();
        for porthole in &self.portholes {
            let porthole = porthole.clone();
            let token = scope.clone();
            listeners.spawn(async move { porthole.listen(&token).await });
        }

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                joined = listeners.join_next() => match joined {
                    None => break Ok(()),
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => {
                        if scope.is_cancelled() {
                            // Late errors during teardown are not failures.
                            continue;
                        }
                        break Err(err);
                    }
                    Some(Err(join_error)) => break Err(GatewayError::Task(join_error.to_string())),
                }
            }
        };

        // Stop the listeners, then let the proxy drain.
        scope.cancel();
        while listeners.join_next().await.is_some() {}
        let _ = proxy_task.await;

        result
    }
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listens: Vec<String> = self
            .config
            .listen
            .iter()
            .map(ToString::to_string)
            .collect();
        write!(f, "[{}] -> {}", listens.join(" "), scrub_url(&self.config.forward))
    }
}

/// Strips credentials from a forward URL for display: userinfo is removed
/// and the `u`/`p` query parameters (the line-protocol credential
/// convention) are dropped. Everything else survives.
fn scrub_url(url: &Url) -> Url {
    let mut scrubbed = url.clone();
    let _ = scrubbed.set_username("");
    let _ = scrubbed.set_password(None);

    let kept: Vec<(String, String)> = scrubbed
        .query_pairs()
        .filter(|(key, _)| key != "u" && key != "p")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        scrubbed.set_query(None);
    } else {
        scrubbed
            .query_pairs_mut()
            .clear()
            .extend_pairs(kept.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
    scrubbed
}
