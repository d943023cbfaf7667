// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend circuit breakers on top of the recloser crate.
//!
//! The KV client and the document store client each own one breaker. Once a
//! backend keeps failing the breaker opens and calls are refused without
//! touching the network. A refused call surfaces as
//! [`StorageError::CircuitOpen`], which the caches handle like any other
//! backend outage: KV reads fall through to the document store and KV writes
//! are skipped.

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::storage::traits::StorageError;

/// Outcome of a call the breaker did not complete.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("circuit open, call refused")]
    Rejected,

    #[error("backend call failed: {0}")]
    Inner(#[source] E),
}

impl<E: std::fmt::Display> CircuitError<E> {
    /// Map into the storage error space of the backend behind `circuit`.
    pub fn into_storage(self, circuit: &str) -> StorageError {
        match self {
            CircuitError::Rejected => StorageError::CircuitOpen(circuit.to_string()),
            CircuitError::Inner(e) => StorageError::Backend(e.to_string()),
        }
    }
}

/// Trip and recovery settings of one breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failure rate (percent) over the closed window that opens the circuit
    pub failure_rate_percent: u32,
    /// Calls observed while closed before the rate is judged
    pub window: usize,
    /// Trial calls let through while half-open
    pub half_open_calls: usize,
    /// Time spent open before the first trial call
    pub open_wait: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_rate_percent: 50,
            window: 10,
            half_open_calls: 2,
            open_wait: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Document store: it is the source of truth and must not be hammered
    /// while it struggles.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_rate_percent: 30,
            window: 6,
            half_open_calls: 3,
            open_wait: Duration::from_secs(60),
        }
    }

    /// KV store: every failure already has a fallback, so trip late and
    /// retry soon.
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_rate_percent: 70,
            window: 20,
            half_open_calls: 1,
            open_wait: Duration::from_secs(15),
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_rate_percent: 50,
            window: 2,
            half_open_calls: 1,
            open_wait: Duration::from_millis(50),
        }
    }
}

/// Point-in-time call accounting of a breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

/// A named breaker guarding one backend client.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_rate_percent.min(100) as f32 / 100.0)
            .closed_len(config.window.max(1))
            .half_open_len(config.half_open_calls.max(1))
            .open_wait(config.open_wait)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` unless the circuit is open.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(value) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(value)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Backend circuit open, call refused");
                crate::metrics::record_circuit_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Backend call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// [`call`](Self::call) for backend clients, with the outcome already in
    /// the storage error space.
    pub async fn call_storage<F, Fut, T, E>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.call(f).await.map_err(|e| e.into_storage(&self.name))
    }

    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            calls: self.calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}
