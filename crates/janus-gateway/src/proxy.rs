// Copyright 2024-Present the Janus authors.
// SPDX-License-Identifier: Apache-2.0

//! Batching HTTP sender.
//!
//! Writers append payloads to the current batch; a newline keeps adjacent
//! payloads apart so line-oriented intake endpoints parse the body. Batches
//! seal when they reach the flush size, when the flush timer fires, or on
//! cancellation, and sealed batches queue for a single dispatcher task that
//! POSTs them in order. One flush is in flight per proxy at any moment; the
//! process-wide [`RequestLimit`](crate::limit::RequestLimit) further caps
//! concurrency across proxies.
//!
//! Delivery is best effort. Transient dispatch failures retry with backoff;
//! batches that exhaust their retries, hit a permanent status, or get caught
//! by cancellation are dropped and logged.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use crate::backoff::Backoff;
use crate::error::GatewayError;
use crate::gateway::PortConfig;
use crate::limit::RequestLimit;

/// Sealed batches waiting for dispatch are bounded; when a dead endpoint
/// backs the queue up past this, the oldest batch is dropped.
const MAX_PENDING_BATCHES: usize = 128;

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Batching HTTP forwarder for one destination URL.
///
/// Cloning shares the underlying batch state; the gateway hands clones to
/// each of its portholes.
#[derive(Clone, Debug)]
pub struct Proxy {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    forward: Url,
    flush_size: usize,
    write_timeout: Duration,
    max_retries: u32,
    backoff: Backoff,
    limit: RequestLimit,
    client: reqwest::Client,
    state: Mutex<BatchState>,
    wakeup: Notify,
}

#[derive(Default, Debug)]
struct BatchState {
    current: Vec<u8>,
    sealed: VecDeque<Vec<u8>>,
    closed: bool,
}

struct DispatchFailure {
    permanent: bool,
    reason: String,
}

impl Proxy {
    pub fn new(config: &PortConfig, limit: RequestLimit) -> Result<Proxy, GatewayError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(GatewayError::HttpClient)?;
        Ok(Proxy {
            inner: Arc::new(Inner {
                forward: config.forward.clone(),
                flush_size: config.flush_size,
                write_timeout: config.write_timeout,
                max_retries: config.max_retries,
                backoff: config.backoff,
                limit,
                client,
                state: Mutex::new(BatchState::default()),
                wakeup: Notify::new(),
            }),
        })
    }

    /// Appends one payload to the current batch.
    ///
    /// Never performs I/O; the mutex is held only for the buffer
    /// manipulation. Appending seals the prior batch when the payload would
    /// push it past the flush size, and seals the new batch immediately when
    /// it reaches the flush size on its own.
    ///
    /// Returns [`GatewayError::ProxyClosed`] once the proxy has drained.
    pub fn write(&self, payload: &[u8]) -> Result<(), GatewayError> {
        let Some(&last) = payload.last() else {
            return Ok(());
        };
        let appended = payload.len() + usize::from(last != b'\n');

        let mut sealed = false;
        {
            let mut state = self.lock_state();
            if state.closed {
                return Err(GatewayError::ProxyClosed);
            }
            if !state.current.is_empty() && state.current.len() + appended > self.inner.flush_size
            {
                sealed |= seal_locked(&mut state);
            }
            state.current.extend_from_slice(payload);
            if last != b'\n' {
                state.current.push(b'\n');
            }
            if state.current.len() >= self.inner.flush_size {
                sealed |= seal_locked(&mut state);
            }
        }
        if sealed {
            self.inner.wakeup.notify_one();
        }
        Ok(())
    }

    /// Starts the periodic flusher and the dispatcher.
    ///
    /// The returned handle completes once cancellation has been observed and
    /// every remaining batch has been dispatched or dropped.
    pub fn start(&self, cancel: CancellationToken, flush_interval: Duration) -> JoinHandle<()> {
        let flush_interval = if flush_interval.is_zero() {
            DEFAULT_FLUSH_INTERVAL
        } else {
            flush_interval
        };

        let flusher = {
            let proxy = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { proxy.run_flusher(cancel, flush_interval).await })
        };
        let dispatcher = {
            let proxy = self.clone();
            tokio::spawn(async move { proxy.run_dispatcher(cancel).await })
        };

        tokio::spawn(async move {
            let _ = flusher.await;
            let _ = dispatcher.await;
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, BatchState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_flusher(&self, cancel: CancellationToken, flush_interval: Duration) {
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sealed = seal_locked(&mut self.lock_state());
                    if sealed {
                        self.inner.wakeup.notify_one();
                    }
                }
                _ = cancel.cancelled() => {
                    let mut state = self.lock_state();
                    seal_locked(&mut state);
                    state.closed = true;
                    drop(state);
                    self.inner.wakeup.notify_one();
                    return;
                }
            }
        }
    }

    async fn run_dispatcher(&self, cancel: CancellationToken) {
        loop {
            let batch = self.lock_state().sealed.pop_front();
            if let Some(batch) = batch {
                self.dispatch(batch, &cancel).await;
                continue;
            }

            {
                let state = self.lock_state();
                if state.closed && state.sealed.is_empty() {
                    break;
                }
            }

            if cancel.is_cancelled() {
                // Draining: the flusher seals the remainder, flips closed,
                // and wakes us.
                self.inner.wakeup.notified().await;
            } else {
                tokio::select! {
                    _ = self.inner.wakeup.notified() => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
        debug!("proxy for {} closed", self.inner.forward);
    }

    async fn dispatch(&self, batch: Vec<u8>, cancel: &CancellationToken) {
        let draining = cancel.is_cancelled();
        let _permit = if draining {
            // During drain every other holder is also down to its last
            // request, so this wait is bounded by one request timeout.
            self.inner.limit.acquire().await
        } else {
            tokio::select! {
                permit = self.inner.limit.acquire() => permit,
                _ = cancel.cancelled() => {
                    warn!(
                        "dropping {} byte batch for {}: cancelled while waiting for a request slot",
                        batch.len(),
                        self.inner.forward
                    );
                    return;
                }
            }
        };

        let mut attempt: u32 = 0;
        loop {
            match self.post(&batch).await {
                Ok(()) => {
                    debug!("flushed {} bytes to {}", batch.len(), self.inner.forward);
                    return;
                }
                Err(failure) if failure.permanent => {
                    error!(
                        "dropping {} byte batch for {}: {}",
                        batch.len(),
                        self.inner.forward,
                        failure.reason
                    );
                    return;
                }
                Err(failure) => {
                    if attempt >= self.inner.max_retries {
                        error!(
                            "dropping {} byte batch for {} after {} attempts: {}",
                            batch.len(),
                            self.inner.forward,
                            attempt + 1,
                            failure.reason
                        );
                        return;
                    }
                    attempt += 1;
                    let wait = self.inner.backoff.delay(attempt, self.inner.max_retries);
                    debug!(
                        "dispatch to {} failed ({}), retry {} in {:?}",
                        self.inner.forward, failure.reason, attempt, wait
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => {
                            error!(
                                "dropping {} byte batch for {}: cancelled during retry backoff",
                                batch.len(),
                                self.inner.forward
                            );
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn post(&self, batch: &[u8]) -> Result<(), DispatchFailure> {
        let mut request = self
            .inner
            .client
            .post(self.inner.forward.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(batch.to_vec());
        if !self.inner.write_timeout.is_zero() {
            request = request.timeout(self.inner.write_timeout);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    Ok(())
                } else {
                    Err(DispatchFailure {
                        // 5xx is worth another attempt; anything else from
                        // the endpoint is a verdict on the request itself.
                        permanent: !status.is_server_error(),
                        reason: format!("endpoint returned {status}"),
                    })
                }
            }
            Err(source) => Err(DispatchFailure {
                permanent: false,
                reason: source.to_string(),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_bytes(&self) -> Vec<u8> {
        self.lock_state().current.clone()
    }

    #[cfg(test)]
    pub(crate) fn sealed_batches(&self) -> Vec<Vec<u8>> {
        self.lock_state().sealed.iter().cloned().collect()
    }
}

fn seal_locked(state: &mut BatchState) -> bool {
    if state.current.is_empty() {
        return false;
    }
    if state.sealed.len() >= MAX_PENDING_BATCHES {
        state.sealed.pop_front();
        warn!("batch queue full ({MAX_PENDING_BATCHES} pending), dropping oldest batch");
    }
    state.sealed.push_back(std::mem::take(&mut state.current));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PortConfig;

    fn test_config(forward: &str) -> PortConfig {
        let mut config = PortConfig::new(Vec::new(), Url::parse(forward).unwrap());
        config.flush_size = 64;
        config
    }

    fn fast_backoff() -> Backoff {
        Backoff {
            interval: Duration::from_millis(5),
            factor: 1.0,
            grow: Duration::from_millis(1),
            min: Duration::ZERO,
            max: Duration::from_millis(25),
            max_exp: 20,
            exp_m: 1.0,
            exp_scale: 1.5,
        }
    }

    #[tokio::test]
    async fn test_write_appends_boundary_newline() {
        let proxy = Proxy::new(&test_config("http://127.0.0.1:1/write"), RequestLimit::unlimited())
            .unwrap();
        proxy.write(b"abc").unwrap();
        proxy.write(b"def\n").unwrap();
        assert_eq!(proxy.pending_bytes(), b"abc\ndef\n");
    }

    #[tokio::test]
    async fn test_write_ignores_empty_payload() {
        let proxy = Proxy::new(&test_config("http://127.0.0.1:1/write"), RequestLimit::unlimited())
            .unwrap();
        proxy.write(b"").unwrap();
        assert!(proxy.pending_bytes().is_empty());
        assert!(proxy.sealed_batches().is_empty());
    }

    #[tokio::test]
    async fn test_write_seals_prior_batch_before_overflow() {
        let mut config = test_config("http://127.0.0.1:1/write");
        config.flush_size = 10;
        let proxy = Proxy::new(&config, RequestLimit::unlimited()).unwrap();

        proxy.write(b"aaaa").unwrap(); // 5 bytes with newline
        proxy.write(b"bbbbbbbb").unwrap(); // would exceed 10, seals "aaaa\n"

        let sealed = proxy.sealed_batches();
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0], b"aaaa\n");
        assert_eq!(proxy.pending_bytes(), b"bbbbbbbb\n");
    }

    #[tokio::test]
    async fn test_write_seals_exactly_at_threshold() {
        let mut config = test_config("http://127.0.0.1:1/write");
        config.flush_size = 5;
        let proxy = Proxy::new(&config, RequestLimit::unlimited()).unwrap();

        proxy.write(b"abcde").unwrap(); // 6 bytes with newline, >= 5
        let sealed = proxy.sealed_batches();
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0], b"abcde\n");
        assert!(proxy.pending_bytes().is_empty());
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let proxy = Proxy::new(&test_config("http://127.0.0.1:1/write"), RequestLimit::unlimited())
            .unwrap();
        let cancel = CancellationToken::new();
        let handle = proxy.start(cancel.clone(), Duration::from_secs(3600));
        cancel.cancel();
        handle.await.unwrap();

        let err = proxy.write(b"late").unwrap_err();
        assert!(matches!(err, GatewayError::ProxyClosed));
    }

    #[tokio::test]
    async fn test_timer_flush_posts_batch() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/write")
            .match_header("content-type", "application/octet-stream")
            .match_body("a\nb\n")
            .with_status(204)
            .create_async()
            .await;

        let proxy = Proxy::new(
            &test_config(&format!("{}/write", server.url())),
            RequestLimit::unlimited(),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let handle = proxy.start(cancel.clone(), Duration::from_millis(50));

        proxy.write(b"a").unwrap();
        proxy.write(b"b").unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        mock.assert_async().await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_posts_pending_batch() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/write")
            .match_body("pending\n")
            .with_status(202)
            .create_async()
            .await;

        let proxy = Proxy::new(
            &test_config(&format!("{}/write", server.url())),
            RequestLimit::unlimited(),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let handle = proxy.start(cancel.clone(), Duration::from_secs(3600));

        proxy.write(b"pending").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        handle.await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/write")
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let mut config = test_config(&format!("{}/write", server.url()));
        config.backoff = fast_backoff();
        let proxy = Proxy::new(&config, RequestLimit::unlimited()).unwrap();
        let cancel = CancellationToken::new();
        let handle = proxy.start(cancel.clone(), Duration::from_millis(20));

        proxy.write(b"rejected").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        mock.assert_async().await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_retries_until_budget() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/write")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let mut config = test_config(&format!("{}/write", server.url()));
        config.backoff = fast_backoff();
        config.max_retries = 2;
        let proxy = Proxy::new(&config, RequestLimit::unlimited()).unwrap();
        let cancel = CancellationToken::new();
        let handle = proxy.start(cancel.clone(), Duration::from_millis(20));

        proxy.write(b"flaky").unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        mock.assert_async().await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_batches_dispatch_in_seal_order() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("POST", "/write")
            .match_body("11111111\n")
            .with_status(204)
            .create_async()
            .await;
        let second = server
            .mock("POST", "/write")
            .match_body("2222\n")
            .with_status(204)
            .create_async()
            .await;

        let mut config = test_config(&format!("{}/write", server.url()));
        config.flush_size = 8;
        let proxy = Proxy::new(&config, RequestLimit::unlimited()).unwrap();
        let cancel = CancellationToken::new();
        let handle = proxy.start(cancel.clone(), Duration::from_secs(3600));

        proxy.write(b"11111111").unwrap(); // seals on size
        proxy.write(b"2222").unwrap(); // drained on cancel

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        first.assert_async().await;
        second.assert_async().await;
    }
}
