use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::settings::LimitsConfig;
use crate::utils::error::ApiError;

/// Concurrency gates in front of the generative and embedding backends.
#[derive(Clone)]
pub struct Limiters {
    pub embedding: Arc<Semaphore>,
    pub llm_generate: Arc<Semaphore>,
    pub llm_stream: Arc<Semaphore>,
    pub acquire_timeout: Duration,
}

impl Limiters {
    pub fn new(cfg: &LimitsConfig) -> Self {
        Self {
            embedding: Arc::new(Semaphore::new(cfg.embedding_concurrency.max(1))),
            llm_generate: Arc::new(Semaphore::new(cfg.llm_generate_concurrency.max(1))),
            llm_stream: Arc::new(Semaphore::new(cfg.llm_stream_concurrency.max(1))),
            acquire_timeout: Duration::from_millis(cfg.acquire_timeout_ms.max(1)),
        }
    }

    /// Wait for a permit, failing with an upstream error once `acquire_timeout` elapses.
    pub async fn acquire_timed(
        sem: Arc<Semaphore>,
        acquire_timeout: Duration,
        op: &'static str,
    ) -> Result<(OwnedSemaphorePermit, Duration), ApiError> {
        let start = Instant::now();

        let permit = tokio::time::timeout(acquire_timeout, sem.acquire_owned())
            .await
            .map_err(|_| {
                ApiError::UpstreamGeneration(format!("Backend busy, limiter timeout for op={}", op))
            })?
            .map_err(|_| ApiError::Internal(format!("Limiter closed for op={}", op)))?;

        let waited = start.elapsed();
        if waited > Duration::from_millis(100) {
            tracing::debug!(op, waited_ms = waited.as_millis() as u64, "Limiter wait");
        }

        Ok((permit, waited))
    }
}
