use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::signals::SignalScorers;
use crate::models::{ActionData, EmotionData, MessageMetadata};
use crate::services::conversation::AssembledPrompt;
use crate::services::llm_service::{GenerationParams, LlmProvider};
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: AssembledPrompt,
    pub params: GenerationParams,
    pub include_emotion: bool,
    pub include_action: bool,
    /// The user's text, scanned together with the reply for significance.
    pub user_text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedResponse {
    pub text: String,
    pub emotion: Option<EmotionData>,
    pub action: Option<ActionData>,
    pub significant: bool,
    pub processing_time_ms: u64,
}

impl GeneratedResponse {
    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            emotion: self.emotion.clone(),
            action: self.action.clone(),
            processing_time_ms: Some(self.processing_time_ms),
            significant: Some(self.significant),
            ..Default::default()
        }
    }
}

/// Output of incremental mode. Chunks arrive in generation order followed by
/// exactly one `Completed` or `Failed`.
#[derive(Debug)]
pub enum OrchestratorEvent {
    Chunk { index: usize, text: String },
    Completed(GeneratedResponse),
    Failed(ApiError),
}

#[derive(Clone)]
pub struct ResponseOrchestrator {
    llm: Arc<dyn LlmProvider>,
    signals: SignalScorers,
    limiters: Limiters,
    timeout: Duration,
}

impl ResponseOrchestrator {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        signals: SignalScorers,
        limiters: Limiters,
        timeout: Duration,
    ) -> Self {
        Self {
            llm,
            signals,
            limiters,
            timeout,
        }
    }

    fn timed_out(&self) -> ApiError {
        ApiError::UpstreamGeneration(format!(
            "Generation timed out after {}s",
            self.timeout.as_secs_f32()
        ))
    }

    fn finish(&self, request: &GenerationRequest, text: String, started: Instant) -> GeneratedResponse {
        let emotion = request
            .include_emotion
            .then(|| self.signals.emotion.classify(&text));
        let action = if request.include_action {
            self.signals.action.extract(&text)
        } else {
            None
        };
        let significant = self
            .signals
            .significance
            .is_significant(&request.user_text, &text);

        GeneratedResponse {
            text,
            emotion,
            action,
            significant,
            processing_time_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Single-shot mode, bounded by the configured timeout.
    pub async fn respond(&self, request: &GenerationRequest) -> Result<GeneratedResponse, ApiError> {
        let started = Instant::now();
        let (_permit, _) = Limiters::acquire_timed(
            self.limiters.llm_generate.clone(),
            self.limiters.acquire_timeout,
            "llm_generate",
        )
        .await?;

        let call = self.llm.generate(
            &request.prompt.system,
            &request.prompt.messages,
            &request.params,
        );

        let text = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| self.timed_out())?
            .map_err(|e| ApiError::UpstreamGeneration(format!("{:#}", e)))?;

        debug!(chars = text.len(), "Generation complete");
        Ok(self.finish(request, text, started))
    }

    /// Incremental mode. Dropping the receiver cancels the backend call.
    pub fn respond_stream(
        &self,
        request: GenerationRequest,
        buffer: usize,
    ) -> mpsc::Receiver<OrchestratorEvent> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let this = self.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let terminal = match this.drive_stream(&request, &tx).await {
                Ok(Some(text)) => OrchestratorEvent::Completed(this.finish(&request, text, started)),
                Ok(None) => {
                    debug!("Stream receiver dropped, generation cancelled");
                    return;
                }
                Err(e) => {
                    warn!(code = e.code(), "Streamed generation failed: {}", e.detail());
                    OrchestratorEvent::Failed(e)
                }
            };
            let _ = tx.send(terminal).await;
        });

        rx
    }

    /// `Ok(None)` when the receiver went away before completion.
    async fn drive_stream(
        &self,
        request: &GenerationRequest,
        tx: &mpsc::Sender<OrchestratorEvent>,
    ) -> Result<Option<String>, ApiError> {
        let deadline = tokio::time::Instant::now() + self.timeout;

        let (_permit, _) = tokio::select! {
            biased;
            _ = tx.closed() => return Ok(None),
            permit = Limiters::acquire_timed(
                self.limiters.llm_stream.clone(),
                self.limiters.acquire_timeout,
                "llm_stream",
            ) => permit?,
        };

        let open = self.llm.generate_stream(
            &request.prompt.system,
            &request.prompt.messages,
            &request.params,
        );
        let mut stream = tokio::select! {
            biased;
            _ = tx.closed() => return Ok(None),
            opened = tokio::time::timeout_at(deadline, open) => opened
                .map_err(|_| self.timed_out())?
                .map_err(|e| ApiError::UpstreamGeneration(format!("{:#}", e)))?,
        };

        let mut full = String::new();
        let mut index = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                _ = tx.closed() => return Ok(None),
                next = tokio::time::timeout_at(deadline, stream.next()) => next,
            };

            match next {
                Err(_) => return Err(self.timed_out()),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(ApiError::UpstreamGeneration(format!("{:#}", e))),
                Ok(Some(Ok(text))) => {
                    if text.is_empty() {
                        continue;
                    }
                    full.push_str(&text);
                    if tx.send(OrchestratorEvent::Chunk { index, text }).await.is_err() {
                        return Ok(None);
                    }
                    index += 1;
                }
            }
        }

        Ok(Some(full))
    }
}
