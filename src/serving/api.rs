//! Remote API backend.
//!
//! One request per input, at most `max_workers` in flight. Transient failures
//! are retried with exponential backoff; an item that runs out of attempts
//! becomes [`ServingOutput::Failed`] and the rest of the batch carries on. A
//! fatal failure aborts the whole batch.

use super::{GenerationParams, HttpTransport, ServingOutput, Transport};
use crate::models::{ApiServingConfig, Result, SieveError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Retry schedule for transient failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per item, including the first
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (zero-based).
    ///
    /// A server `Retry-After` hint replaces the computed delay; both are capped.
    pub fn backoff(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let delay = hint.unwrap_or_else(|| {
            self.base_backoff
                .saturating_mul(2u32.saturating_pow(attempt))
        });
        delay.min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

/// Usage snapshot for an API backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApiStats {
    /// Requests sent, retries included
    pub requests: u64,
    pub retries: u64,
    /// Items that ended as `Failed`
    pub failures: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Remote API serving backend.
pub struct ApiServing {
    name: String,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    max_workers: usize,
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl ApiServing {
    pub fn from_config(name: &str, config: &ApiServingConfig) -> Result<Self> {
        let transport = HttpTransport::from_config(name, config)?;
        let retry = RetryPolicy {
            max_attempts: config.max_retries.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
        };
        info!(
            serving = name,
            url = %config.api_url,
            model = %config.model,
            max_workers = config.max_workers,
            "API serving ready"
        );
        Ok(Self::with_transport(
            name,
            Arc::new(transport),
            config.max_workers,
            retry,
        ))
    }

    /// Build around any transport.
    pub fn with_transport(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        max_workers: usize,
        retry: RetryPolicy,
    ) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            name: name.into(),
            transport,
            retry,
            max_workers,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn stats(&self) -> ApiStats {
        let c = &self.counters;
        ApiStats {
            requests: c.requests.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            prompt_tokens: c.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: c.completion_tokens.load(Ordering::Relaxed),
        }
    }

    /// Send every input, preserving order in the output.
    pub async fn request(
        &self,
        inputs: &[String],
        params: &GenerationParams,
    ) -> Result<Vec<ServingOutput>> {
        let start = Instant::now();
        let aborted = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(inputs.len());

        // Submission blocks on a permit, so at most `max_workers` tasks exist at once.
        for (index, input) in inputs.iter().enumerate() {
            if aborted.load(Ordering::Relaxed) {
                break;
            }
            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|_| SieveError::Internal("Worker pool closed".to_string()))?;

            let worker = Worker {
                serving: self.name.clone(),
                transport: Arc::clone(&self.transport),
                counters: Arc::clone(&self.counters),
                retry: self.retry,
                aborted: Arc::clone(&aborted),
            };
            let input = input.clone();
            let params = params.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                worker.run(index, &input, &params).await
            }));
        }

        let mut outputs = Vec::with_capacity(handles.len());
        let mut pending = handles.into_iter().enumerate();
        while let Some((index, handle)) = pending.next() {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(serving = %self.name, item = index, error = %e, "Serving task died");
                    Ok(ServingOutput::Failed(format!("serving task failed: {e}")))
                }
            };
            match outcome {
                Ok(output) => outputs.push(output),
                Err(e) => {
                    aborted.store(true, Ordering::Relaxed);
                    for (_, handle) in pending {
                        handle.abort();
                    }
                    warn!(serving = %self.name, error = %e, "Batch aborted");
                    return Err(e);
                }
            }
        }

        if outputs.len() != inputs.len() {
            return Err(SieveError::Internal(format!(
                "batch stopped after {} of {} items",
                outputs.len(),
                inputs.len()
            )));
        }

        let failed = outputs.iter().filter(|o| o.is_failed()).count();
        info!(
            serving = %self.name,
            items = outputs.len(),
            failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Batch complete"
        );
        Ok(outputs)
    }
}

/// Everything one spawned item needs.
struct Worker {
    serving: String,
    transport: Arc<dyn Transport>,
    counters: Arc<Counters>,
    retry: RetryPolicy,
    aborted: Arc<AtomicBool>,
}

impl Worker {
    async fn run(&self, index: usize, input: &str, params: &GenerationParams) -> Result<ServingOutput> {
        let mut last_error = String::new();
        for attempt in 0..self.retry.max_attempts {
            if self.aborted.load(Ordering::Relaxed) {
                return Ok(ServingOutput::Failed("batch aborted".to_string()));
            }

            self.counters.requests.fetch_add(1, Ordering::Relaxed);
            match self.transport.send(input, params).await {
                Ok(reply) => {
                    self.counters
                        .prompt_tokens
                        .fetch_add(reply.prompt_tokens, Ordering::Relaxed);
                    self.counters
                        .completion_tokens
                        .fetch_add(reply.completion_tokens, Ordering::Relaxed);
                    return Ok(reply.output);
                }
                Err(e) if e.is_retryable() => {
                    last_error = e.to_string();
                    if attempt + 1 < self.retry.max_attempts {
                        let backoff = self.retry.backoff(attempt, e.retry_after());
                        debug!(
                            serving = %self.serving,
                            item = index,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying after transient failure"
                        );
                        self.counters.retries.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(backoff).await;
                    }
                }
                Err(e) => {
                    self.aborted.store(true, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }

        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            serving = %self.serving,
            item = index,
            attempts = self.retry.max_attempts,
            error = %last_error,
            "Item failed after all attempts"
        );
        Ok(ServingOutput::Failed(last_error))
    }
}
