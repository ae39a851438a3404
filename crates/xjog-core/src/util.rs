// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Small shared utilities: the timed mutex and correlation ids.

use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use crate::error::ChartError;

/// A `tokio::sync::Mutex` whose acquisition is bounded by a timeout.
///
/// A timeout is a liveness failure (typically an infinite event loop in a
/// chart): callers surface it as [`ChartError::MutexTimeout`] and the
/// engine shuts down.
pub struct TimedMutex<T> {
    inner: Mutex<T>,
    timeout: Duration,
}

impl<T> TimedMutex<T> {
    /// Wrap `value` with the given acquisition timeout.
    pub fn new(value: T, timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(value),
            timeout,
        }
    }

    /// Acquire the mutex within the timeout; `scope` names the guarded
    /// resource in the error.
    pub async fn lock(&self, scope: &str) -> Result<MutexGuard<'_, T>, ChartError> {
        tokio::time::timeout(self.timeout, self.inner.lock())
            .await
            .map_err(|_| ChartError::MutexTimeout {
                scope: scope.to_string(),
            })
    }

    /// Acquire without a deadline. Used where waiting is the point, e.g.
    /// waiting for an evicted executor to fall idle.
    pub async fn lock_unbounded(&self) -> MutexGuard<'_, T> {
        self.inner.lock().await
    }
}

/// Short correlation id attached to log records so all entries of one
/// logical operation can be joined.
pub fn correlation_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_succeeds_when_free() {
        let mutex = TimedMutex::new(1u32, Duration::from_millis(100));
        let guard = mutex.lock("test").await.unwrap();
        assert_eq!(*guard, 1);
    }

    #[tokio::test]
    async fn lock_times_out_when_held() {
        let mutex = TimedMutex::new((), Duration::from_millis(20));
        let _held = mutex.lock("outer").await.unwrap();
        let error = mutex.lock("inner").await.unwrap_err();
        assert!(matches!(error, ChartError::MutexTimeout { scope } if scope == "inner"));
    }

    #[test]
    fn correlation_ids_are_short_and_distinct() {
        let a = correlation_id();
        let b = correlation_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }
}
