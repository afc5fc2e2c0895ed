// Copyright 2024-Present the Janus authors.
// SPDX-License-Identifier: Apache-2.0

//! UDP ingress listener.
//!
//! A porthole owns one UDP socket and feeds every datagram it receives into
//! its proxy, in arrival order. Reads run under a deadline so cancellation
//! is observed promptly, temporary network errors are absorbed, and a dead
//! listener is rebound with a bounded retry budget. A listener that stayed
//! up for more than a minute before failing earns its budget back, since a
//! long-lived socket going away usually means a DNS change rather than a
//! configuration problem.

use std::io;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::addr::ListenAddr;
use crate::backoff::Backoff;
use crate::error::GatewayError;
use crate::proxy::Proxy;

/// Largest possible UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Rebind attempts before the porthole gives up.
const BIND_RETRIES: u32 = 10;

/// A listener that survived this long gets its retry counter reset.
const REBIND_CREDIT: Duration = Duration::from_secs(60);

/// One UDP listener bound to one address, feeding one proxy.
#[derive(Clone, Debug)]
pub struct Porthole {
    addr: ListenAddr,
    proxy: Proxy,
    read_timeout: Duration,
}

#[derive(Debug)]
enum ListenError {
    Cancelled,
    Resolve(io::Error),
    Bind(io::Error),
    Read(io::Error),
    Proxy(GatewayError),
}

impl ListenError {
    fn into_gateway_error(self, addr: &ListenAddr) -> GatewayError {
        match self {
            ListenError::Resolve(source) => GatewayError::Resolve {
                addr: addr.to_string(),
                source,
            },
            ListenError::Bind(source) => GatewayError::Bind {
                addr: addr.to_string(),
                source,
            },
            ListenError::Read(source) => GatewayError::Read {
                addr: addr.to_string(),
                source,
            },
            ListenError::Proxy(err) => err,
            ListenError::Cancelled => GatewayError::Task("listener cancelled".to_string()),
        }
    }
}

impl Porthole {
    pub fn new(addr: ListenAddr, proxy: Proxy, read_timeout: Duration) -> Porthole {
        Porthole {
            addr,
            proxy,
            read_timeout,
        }
    }

    pub fn addr(&self) -> &ListenAddr {
        &self.addr
    }

    /// Runs the listener until cancellation or an unrecoverable error.
    ///
    /// Bind failures are not retried: if something else owns the port, that
    /// is a configuration problem, not a transient one. Everything else gets
    /// up to [`BIND_RETRIES`] rebind attempts with a growing, jittered wait
    /// between them.
    pub async fn listen(&self, cancel: &CancellationToken) -> Result<(), GatewayError> {
        let rebind = Backoff::default();
        let mut attempt: u32 = 1;
        loop {
            let started = Instant::now();
            info!("[{attempt}] binding to {}", self.addr);

            let failure = match self.listen_once(cancel).await {
                Ok(()) | Err(ListenError::Cancelled) => {
                    info!("halting reads on {}", self.addr);
                    return Ok(());
                }
                Err(ListenError::Bind(source)) => {
                    error!(
                        "[{attempt}] unable to bind to {} -- will not retry: {source}",
                        self.addr
                    );
                    return Err(GatewayError::Bind {
                        addr: self.addr.to_string(),
                        source,
                    });
                }
                Err(other) => other.into_gateway_error(&self.addr),
            };

            if started.elapsed() > REBIND_CREDIT {
                attempt = 1;
            }
            if attempt >= BIND_RETRIES {
                error!(
                    "[{attempt}] all attempts to listen on {} have failed: {failure}",
                    self.addr
                );
                return Err(failure);
            }

            let wait = Duration::from_secs(2 * u64::from(attempt))
                + rebind.delay(attempt, BIND_RETRIES);
            error!(
                "[{attempt}] listener on {} failed: {failure} -- will retry in {wait:?}",
                self.addr
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
            attempt += 1;
        }
    }

    /// One bind worth of reading. The address is re-resolved here so a
    /// rebind observes DNS changes.
    async fn listen_once(&self, cancel: &CancellationToken) -> Result<(), ListenError> {
        if cancel.is_cancelled() {
            return Err(ListenError::Cancelled);
        }

        let target = self.addr.resolve().await.map_err(ListenError::Resolve)?;
        let socket = UdpSocket::bind(target).await.map_err(ListenError::Bind)?;
        debug!("{} bound to {}", self.addr, target);

        // Dropping the socket on any return path below closes it exactly once.
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return Err(ListenError::Cancelled),
                outcome = read_datagram(&socket, &mut buf, self.read_timeout) => outcome,
            };
            self.forward_read(received, &mut buf)?;
        }
    }

    /// Handles the outcome of one read: forward the datagram, absorb
    /// temporary errors, surface everything else. Every arm except
    /// cancellation (handled by the caller) zeroes the buffer, so an
    /// error-interrupted reuse cannot leak stale payload bytes.
    fn forward_read(
        &self,
        received: io::Result<Option<usize>>,
        buf: &mut [u8],
    ) -> Result<(), ListenError> {
        match received {
            // Deadline expired without data; zero and loop so cancellation
            // is checked again.
            Ok(None) => {
                buf.fill(0);
                Ok(())
            }
            Ok(Some(len)) => {
                let block = &mut buf[..len];
                let result = self.proxy.write(block);
                // The payload has been handed off; scrub it.
                block.fill(0);
                result.map_err(ListenError::Proxy)
            }
            Err(err) if is_temporary(&err) => {
                buf.fill(0);
                Ok(())
            }
            Err(err) => {
                buf.fill(0);
                Err(ListenError::Read(err))
            }
        }
    }
}

async fn read_datagram(
    socket: &UdpSocket,
    buf: &mut [u8],
    read_timeout: Duration,
) -> io::Result<Option<usize>> {
    if read_timeout.is_zero() {
        let (len, _) = socket.recv_from(buf).await?;
        return Ok(Some(len));
    }
    match tokio::time::timeout(read_timeout, socket.recv_from(buf)).await {
        Ok(Ok((len, _))) => Ok(Some(len)),
        Ok(Err(err)) => Err(err),
        Err(_elapsed) => Ok(None),
    }
}

/// Errors worth staying bound for. UDP sockets surface ICMP unreachable
/// notices as connection errors on some platforms; none of those mean the
/// listener itself is dead.
fn is_temporary(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}
