use anyhow::Result;
use flume::{bounded, Receiver, Sender};
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::types::{ActivityLog, ActivityStatus};
use crate::config::LoggingConfig;

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Queue capacity (max logs in memory before dropping)
    pub queue_capacity: usize,

    /// Batch size for sink writes
    pub batch_size: usize,

    /// Max wait time before flushing batch (milliseconds)
    pub batch_timeout_ms: u64,

    /// Number of worker tasks draining the queue
    pub worker_count: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            batch_timeout_ms: 1000,
            worker_count: 2,
        }
    }
}

impl From<&LoggingConfig> for LoggerConfig {
    fn from(cfg: &LoggingConfig) -> Self {
        Self {
            queue_capacity: cfg.activity_queue_capacity.max(1),
            batch_size: cfg.activity_batch_size.max(1),
            batch_timeout_ms: cfg.activity_batch_timeout_ms.max(1),
            worker_count: cfg.activity_workers.max(1),
        }
    }
}

/// Where flushed batches go.
#[derive(Clone)]
pub enum ActivitySink {
    /// `activity_logs` table
    Postgres(PgPool),
    /// One structured tracing event per record
    Tracing,
}

/// Async activity logger with queue mechanism
#[derive(Clone)]
pub struct ActivityLogger {
    sender: Sender<ActivityLog>,
}

impl ActivityLogger {
    /// Initialize logger with background workers
    pub fn new(sink: ActivitySink, config: LoggerConfig) -> Self {
        let (sender, receiver) = bounded(config.queue_capacity);

        info!(
            "Initializing ActivityLogger: queue={}, batch={}, timeout={}ms, workers={}",
            config.queue_capacity, config.batch_size, config.batch_timeout_ms, config.worker_count
        );

        for worker_id in 0..config.worker_count {
            let sink = sink.clone();
            let receiver = receiver.clone();
            let config = config.clone();

            tokio::spawn(async move {
                Self::worker_loop(worker_id, sink, receiver, config).await;
            });
        }

        Self { sender }
    }

    /// Logger with no workers; records stay in the returned receiver.
    #[cfg(test)]
    pub fn detached(capacity: usize) -> (Self, Receiver<ActivityLog>) {
        let (sender, receiver) = bounded(capacity);
        (Self { sender }, receiver)
    }

    /// Log activity (non-blocking, fire-and-forget)
    pub fn log(&self, activity: ActivityLog) {
        if let Err(e) = self.sender.try_send(activity) {
            warn!("Failed to enqueue activity log (queue full?): {}", e);
        }
    }

    async fn worker_loop(
        worker_id: usize,
        sink: ActivitySink,
        receiver: Receiver<ActivityLog>,
        config: LoggerConfig,
    ) {
        debug!("Activity worker {} started", worker_id);

        let mut batch: Vec<ActivityLog> = Vec::with_capacity(config.batch_size);
        let batch_timeout = Duration::from_millis(config.batch_timeout_ms);

        loop {
            // Block for the first record, then fill the batch until the deadline.
            match receiver.recv_async().await {
                Ok(log) => batch.push(log),
                Err(_) => {
                    debug!("Activity worker {} shutting down (channel closed)", worker_id);
                    return;
                }
            }

            let deadline = tokio::time::Instant::now() + batch_timeout;
            let mut closed = false;

            while batch.len() < config.batch_size {
                match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                    Ok(Ok(log)) => batch.push(log),
                    Ok(Err(_)) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            Self::flush_batch(&sink, &batch, worker_id).await;
            batch.clear();

            if closed {
                debug!("Activity worker {} shutting down (channel closed)", worker_id);
                return;
            }
        }
    }

    async fn flush_batch(sink: &ActivitySink, batch: &[ActivityLog], worker_id: usize) {
        match sink {
            ActivitySink::Tracing => {
                for log in batch {
                    emit_tracing(log);
                }
            }
            ActivitySink::Postgres(pool) => {
                let start = std::time::Instant::now();
                match Self::insert_batch(pool, batch).await {
                    Ok(inserted) => debug!(
                        "Worker {} inserted {} activity logs in {:?}",
                        worker_id,
                        inserted,
                        start.elapsed()
                    ),
                    Err(e) => {
                        error!("Worker {} failed to insert batch: {}", worker_id, e);
                        for log in batch {
                            emit_tracing(log);
                        }
                    }
                }
            }
        }
    }

    async fn insert_batch(pool: &PgPool, logs: &[ActivityLog]) -> Result<usize> {
        let mut query_builder = sqlx::QueryBuilder::new(
            r#"
            INSERT INTO activity_logs (
                user_id, conversation_id, character_id, activity_type, status,
                message, error_code, error_message, response_time_ms, metadata, created_at
            )
            "#,
        );

        query_builder.push_values(logs, |mut b, log| {
            b.push_bind(log.user_id)
                .push_bind(log.conversation_id)
                .push_bind(log.character_id)
                .push_bind(log.activity_type.as_str())
                .push_bind(log.status.as_str())
                .push_bind(&log.message)
                .push_bind(&log.error_code)
                .push_bind(&log.error_message)
                .push_bind(log.response_time_ms)
                .push_bind(log.custom_fields.as_ref().map(sqlx::types::Json))
                .push_bind(log.created_at);
        });

        let result = query_builder.build().execute(pool).await?;
        Ok(result.rows_affected() as usize)
    }

    pub fn queue_len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_queue_full(&self) -> bool {
        self.sender.is_full()
    }
}

fn emit_tracing(log: &ActivityLog) {
    let metadata = log
        .custom_fields
        .as_ref()
        .map(|m| serde_json::to_string(m).unwrap_or_default());

    match log.status {
        ActivityStatus::Error | ActivityStatus::Warning => warn!(
            target: "activity",
            activity = log.activity_type.as_str(),
            status = log.status.as_str(),
            user_id = ?log.user_id,
            conversation_id = ?log.conversation_id,
            character_id = ?log.character_id,
            response_time_ms = ?log.response_time_ms,
            error_code = ?log.error_code,
            error = ?log.error_message,
            metadata = ?metadata,
            "{}",
            log.message.as_deref().unwrap_or("")
        ),
        ActivityStatus::Success | ActivityStatus::Info => info!(
            target: "activity",
            activity = log.activity_type.as_str(),
            status = log.status.as_str(),
            user_id = ?log.user_id,
            conversation_id = ?log.conversation_id,
            character_id = ?log.character_id,
            response_time_ms = ?log.response_time_ms,
            metadata = ?metadata,
            "{}",
            log.message.as_deref().unwrap_or("")
        ),
    }
}
