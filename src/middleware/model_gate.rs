// Shared entry point for every model invocation
//
// Bounds the number of in-flight inferences across all documents and keeps
// one circuit breaker per capability so a dead backend fails fast instead of
// burning every document's deadline.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::core::errors::{ModelError, StageError, StageResult};
use crate::core::types::CancelFlag;
use crate::middleware::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::utils::Metrics;

#[derive(Clone)]
pub struct ModelGate {
    permits: Arc<Semaphore>,
    pool_size: usize,
    breakers: Arc<DashMap<String, CircuitBreaker>>,
    breaker_config: CircuitBreakerConfig,
    metrics: Metrics,
}

/// Settles a breaker call on drop if the caller never did (aborted task).
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl CallGuard<'_> {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_neutral();
        }
    }
}

impl ModelGate {
    pub fn new(pool_size: usize, breaker_config: CircuitBreakerConfig, metrics: Metrics) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            breakers: Arc::new(DashMap::new()),
            breaker_config,
            metrics,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    fn breaker(&self, capability: &str) -> CircuitBreaker {
        self.breakers
            .entry(capability.to_string())
            .or_insert_with(|| CircuitBreaker::with_config(self.breaker_config.clone()))
            .clone()
    }

    pub fn breaker_stats(&self) -> Vec<(String, CircuitBreakerStats)> {
        let mut stats: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    /// Runs one synchronous model call on the blocking pool under the
    /// in-flight bound, the breaker, and `timeout`.
    ///
    /// On timeout the call is abandoned, not killed: it keeps its pool
    /// permit until the backend returns, so a stuck backend still counts
    /// against the in-flight bound.
    pub async fn invoke<T, F>(
        &self,
        capability: &str,
        timeout: Duration,
        cancel: &CancelFlag,
        call: F,
    ) -> StageResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, ModelError> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let breaker = self.breaker(capability);
        if !breaker.allow_request() {
            return Err(StageError::ModelUnavailable(format!(
                "{} circuit is open",
                capability
            )));
        }
        let guard = CallGuard {
            breaker: &breaker,
            settled: false,
        };

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StageError::ModelUnavailable("model pool is shut down".to_string()))?;

        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let started = Instant::now();
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            call()
        });
        let outcome = tokio::time::timeout(timeout, handle).await;
        let elapsed = started.elapsed();
        let trips_before = breaker.stats().trips;

        let result = match outcome {
            Ok(Ok(Ok(value))) => {
                breaker.record_success();
                self.metrics.record_inference(true, elapsed);
                Ok(value)
            }
            Ok(Ok(Err(ModelError::Unavailable(msg)))) => {
                breaker.record_failure();
                self.metrics.record_inference(false, elapsed);
                Err(StageError::ModelUnavailable(msg))
            }
            Ok(Ok(Err(ModelError::Inference(msg)))) => {
                // The input was rejected; the capability itself is fine
                breaker.record_neutral();
                self.metrics.record_inference(false, elapsed);
                Err(StageError::InferenceFailed(msg))
            }
            Ok(Err(join_err)) => {
                breaker.record_failure();
                self.metrics.record_inference(false, elapsed);
                Err(StageError::InferenceFailed(format!(
                    "{} backend panicked: {}",
                    capability, join_err
                )))
            }
            Err(_) => {
                breaker.record_failure();
                self.metrics.record_inference(false, elapsed);
                Err(StageError::InferenceTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };
        guard.settle();

        if breaker.stats().trips > trips_before {
            self.metrics.record_circuit_breaker_trip();
            warn!("Circuit opened for model capability '{}'", capability);
        }
        debug!(
            "{} inference finished in {:.2}ms (ok={})",
            capability,
            elapsed.as_secs_f64() * 1000.0,
            result.is_ok()
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gate(pool: usize, threshold: usize) -> ModelGate {
        ModelGate::new(
            pool,
            CircuitBreakerConfig {
                failure_threshold: threshold,
                timeout: Duration::from_secs(60),
                success_threshold: 1,
            },
            Metrics::new(),
        )
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let gate = gate(2, 3);
        let value = gate
            .invoke("locator", Duration::from_secs(1), &CancelFlag::new(), || Ok(7))
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(gate.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_invoke_timeout() {
        let gate = gate(1, 3);
        let err = gate
            .invoke("slow", Duration::from_millis(20), &CancelFlag::new(), || {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::InferenceTimeout { timeout_ms: 20 }));
    }

    #[tokio::test]
    async fn test_breaker_fails_fast() {
        let gate = gate(1, 2);
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = calls.clone();
            let err = gate
                .invoke("down", Duration::from_secs(1), &CancelFlag::new(), move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ModelError::Unavailable("connection refused".into()))
                })
                .await
                .unwrap_err();
            assert!(matches!(err, StageError::ModelUnavailable(_)));
        }

        let calls_before = calls.load(Ordering::SeqCst);
        let calls_clone = calls.clone();
        let err = gate
            .invoke("down", Duration::from_secs(1), &CancelFlag::new(), move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::ModelUnavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), calls_before);

        // Other capabilities are unaffected
        assert!(gate
            .invoke("up", Duration::from_secs(1), &CancelFlag::new(), || Ok(()))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_rejected_input_does_not_trip() {
        let gate = gate(1, 1);
        let err = gate
            .invoke("scorer", Duration::from_secs(1), &CancelFlag::new(), || {
                Err::<(), _>(ModelError::Inference("empty crop".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::InferenceFailed(_)));
        assert!(gate
            .invoke("scorer", Duration::from_secs(1), &CancelFlag::new(), || Ok(()))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let gate = gate(1, 1);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = gate
            .invoke("locator", Duration::from_secs(1), &cancel, || Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Cancelled));
    }
}
