// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The remote data API and the gateway that guards it.
//!
//! The layer never talks to [`RemoteApi`] directly. Every call goes through
//! [`RemoteGateway`], which adds:
//!
//! - a per-call timeout (`tokio::time::timeout`)
//! - a circuit breaker that fails fast after repeated transport failures
//! - a consecutive-failure health tracker
//!
//! Only transport failures ([`RemoteError::Unavailable`], [`RemoteError::Timeout`])
//! count against the breaker and the health tracker. A rejection means the
//! server answered, so the remote is reachable.

pub mod memory;

pub use memory::InMemoryRemote;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics::LatencyTimer;
use crate::queue::Mutation;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network unavailable (or the circuit is open)
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    /// The server refused the request
    #[error("remote rejected request: {0}")]
    Rejected(String),
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
}

impl RemoteError {
    /// Failures that say nothing about the request, only about the link.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    fn status(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Rejected(_) => "rejected",
            Self::Timeout(_) => "timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Applied,
    /// The server holds a newer or incompatible version of the record
    Conflict { server_state: Option<Value> },
}

/// Remote read/write API for domain records.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn get_collection(&self, name: &str) -> Result<Vec<Value>, RemoteError>;
    async fn apply_mutation(&self, mutation: &Mutation) -> Result<MutationOutcome, RemoteError>;
}

/// Tracks consecutive transport failures.
pub struct RemoteHealth {
    healthy: AtomicBool,
    failures: AtomicU64,
    threshold: u64,
}

impl RemoteHealth {
    const DEFAULT_THRESHOLD: u64 = 3;

    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true), // Assume healthy until proven otherwise
            failures: AtomicU64::new(0),
            threshold: Self::DEFAULT_THRESHOLD,
        }
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
        self.healthy.store(true, Ordering::Release);
    }

    pub fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.threshold {
            self.healthy.store(false, Ordering::Release);
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }
}

impl Default for RemoteHealth {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RemoteGateway {
    api: Arc<dyn RemoteApi>,
    timeout: Duration,
    circuit: CircuitBreaker,
    health: RemoteHealth,
}

impl RemoteGateway {
    pub fn new(api: Arc<dyn RemoteApi>, timeout: Duration, circuit: CircuitConfig) -> Self {
        Self {
            api,
            timeout,
            circuit: CircuitBreaker::new("remote_api", circuit),
            health: RemoteHealth::new(),
        }
    }

    #[must_use]
    pub fn health(&self) -> &RemoteHealth {
        &self.health
    }

    #[must_use]
    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn get_collection(&self, name: &str) -> Result<Vec<Value>, RemoteError> {
        let api = self.api.clone();
        self.guarded("get_collection", || async move { api.get_collection(name).await })
            .await
    }

    pub async fn apply_mutation(&self, mutation: &Mutation) -> Result<MutationOutcome, RemoteError> {
        let api = self.api.clone();
        self.guarded("apply_mutation", || async move { api.apply_mutation(mutation).await })
            .await
    }

    async fn guarded<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, RemoteError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let _timer = LatencyTimer::new(operation);
        let timeout = self.timeout;

        // Transport failures fail the circuit call; everything else passes
        // through it as a success carrying the server's answer.
        let outcome = self
            .circuit
            .call(|| async move {
                match tokio::time::timeout(timeout, call()).await {
                    Err(_) => Err(RemoteError::Timeout(timeout)),
                    Ok(Err(e)) if e.is_transport() => Err(e),
                    Ok(answer) => Ok(answer),
                }
            })
            .await;

        let result = match outcome {
            Ok(answer) => {
                self.health.record_success();
                answer
            }
            Err(CircuitError::Inner(e)) => {
                self.health.record_failure();
                debug!(operation, error = %e, failures = self.health.failure_count(), "Remote call failed");
                Err(e)
            }
            Err(CircuitError::Rejected) => {
                Err(RemoteError::Unavailable("circuit open".into()))
            }
        };

        match &result {
            Ok(_) => crate::metrics::record_remote_call(operation, "success"),
            Err(e) => {
                if matches!(e, RemoteError::Rejected(_)) {
                    warn!(operation, error = %e, "Remote rejected request");
                }
                crate::metrics::record_remote_call(operation, e.status());
            }
        }
        result
    }
}
