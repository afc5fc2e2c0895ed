// Copyright 2024-Present the Janus authors.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide ceiling on concurrent outbound HTTP dispatches.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Shared cap on in-flight HTTP requests across every proxy in the process.
///
/// Cloning is cheap; all clones share the same underlying semaphore. A
/// non-positive limit disables the ceiling entirely.
#[derive(Debug, Clone, Default)]
pub struct RequestLimit {
    semaphore: Option<Arc<Semaphore>>,
}

impl RequestLimit {
    pub fn new(max_requests: i64) -> Self {
        let semaphore = if max_requests > 0 {
            Some(Arc::new(Semaphore::new(max_requests as usize)))
        } else {
            None
        };
        RequestLimit { semaphore }
    }

    /// Unlimited concurrency; [`acquire`](Self::acquire) returns immediately.
    pub fn unlimited() -> Self {
        RequestLimit { semaphore: None }
    }

    /// Waits for a dispatch slot. Returns `None` when no ceiling is
    /// configured; the permit, when present, releases the slot on drop.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        match &self.semaphore {
            // The semaphore is never closed, so acquisition only fails if
            // every permit has been leaked; treat that as unlimited rather
            // than deadlocking shutdown.
            Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unlimited_never_blocks() {
        let limit = RequestLimit::new(0);
        for _ in 0..64 {
            assert!(limit.acquire().await.is_none());
        }
    }

    #[tokio::test]
    async fn test_limit_caps_concurrency() {
        let limit = RequestLimit::new(2);
        let first = limit.acquire().await;
        let second = limit.acquire().await;
        assert!(first.is_some());
        assert!(second.is_some());

        // Third slot is unavailable until a permit drops.
        let blocked = tokio::time::timeout(Duration::from_millis(50), limit.acquire()).await;
        assert!(blocked.is_err());

        drop(first);
        let third = tokio::time::timeout(Duration::from_millis(50), limit.acquire())
            .await
            .unwrap();
        assert!(third.is_some());
        drop(second);
        drop(third);
    }

    #[tokio::test]
    async fn test_shared_between_clones() {
        let limit = RequestLimit::new(1);
        let other = limit.clone();
        let held = limit.acquire().await;
        let blocked = tokio::time::timeout(Duration::from_millis(50), other.acquire()).await;
        assert!(blocked.is_err());
        drop(held);
    }
}
