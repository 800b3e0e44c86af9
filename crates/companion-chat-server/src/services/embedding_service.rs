use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::utils::similarity::l2_normalize;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimension(&self) -> usize;
}

/// Build the provider selected in configuration.
pub fn build_embedding_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    Ok(match config.provider {
        EmbeddingProviderKind::Local => Arc::new(HashingEmbedder::new(config.dimension)?),
        EmbeddingProviderKind::Http => Arc::new(EmbeddingService::new(config.clone())?),
    })
}

// ===== HTTP EMBEDDING SERVER =====

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    content: &'a str,
    input: &'a str,
    model: &'a str,
}

/// llama.cpp / OpenAI compatible embedding client.
#[derive(Clone)]
pub struct EmbeddingService {
    client: Client,
    config: EmbeddingConfig,
}

impl EmbeddingService {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, config })
    }
}

fn floats(values: &[Value]) -> Vec<f32> {
    values
        .iter()
        .filter_map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

/// Accepts `{"embedding": [..]}`, `{"data": [{"embedding": [..]}]}`,
/// `[{"embedding": [..]}]` and a bare `[..]`.
fn parse_embedding_response(json: &Value) -> Result<Vec<f32>> {
    let embedding = match json {
        Value::Array(arr) => match arr.first() {
            None => anyhow::bail!("Empty array returned from embedding server"),
            Some(Value::Object(first)) => match first.get("embedding") {
                Some(Value::Array(values)) => floats(values),
                _ => anyhow::bail!("Unrecognized embedding response format: {}", json),
            },
            Some(_) => floats(arr),
        },
        Value::Object(obj) => match (obj.get("embedding"), obj.get("data")) {
            (Some(Value::Array(values)), _) => floats(values),
            (_, Some(Value::Array(data))) => match data.first().and_then(|d| d.get("embedding")) {
                Some(Value::Array(values)) => floats(values),
                _ => anyhow::bail!("Unrecognized embedding response format: {}", json),
            },
            _ => anyhow::bail!("Unrecognized embedding response format: {}", json),
        },
        _ => anyhow::bail!("Unrecognized embedding response format: {}", json),
    };

    if embedding.is_empty() {
        anyhow::bail!("Generated embedding is empty");
    }
    Ok(embedding)
}

#[async_trait]
impl EmbeddingProvider for EmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        debug!("Generating embedding for {} chars", text.len());

        let request = EmbeddingRequest {
            content: text,
            input: text,
            model: &self.config.model,
        };

        let response = self
            .client
            .post(format!("{}/embedding", self.config.base_url))
            .json(&request)
            .send()
            .await
            .context("Failed to connect to embedding server")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding API error ({}): {}", status, body);
        }

        let json: Value = response
            .json()
            .await
            .context("Failed to parse embedding response as JSON")?;

        let embedding = parse_embedding_response(&json)?;
        if embedding.len() != self.config.dimension {
            anyhow::bail!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.config.dimension,
                embedding.len()
            );
        }
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }
}

// ===== LOCAL HASHING EMBEDDER =====

/// Keyword groups that get a dedicated dimension each, so texts about the same
/// kind of thing land close together even without shared tokens.
const CONCEPTS: &[&[&str]] = &[
    // preference
    &[
        "like", "likes", "liked", "love", "loves", "enjoy", "enjoys", "enjoyed", "prefer",
        "prefers", "preference", "favorite", "favourite", "hobby", "hobbies", "fan",
    ],
    // identity
    &[
        "name", "named", "age", "old", "live", "lives", "location", "born", "job", "work",
    ],
    // event
    &[
        "happened", "did", "went", "visited", "yesterday", "trip", "met", "event",
    ],
    // emotion
    &[
        "feel", "feeling", "happy", "sad", "angry", "afraid", "excited", "lonely", "upset",
    ],
];

const CONCEPT_WEIGHT: f32 = 2.0;

const STOPWORDS: &[&str] = &[
    "the", "an", "and", "or", "of", "to", "in", "on", "at", "for", "with", "is", "are", "was",
    "were", "be", "been", "do", "does", "what", "which", "who", "how", "that", "this", "it",
    "its", "me", "my", "you", "your", "we", "our", "they", "their", "he", "she", "his", "her",
];

/// Deterministic in-process embedder: signed feature hashing of word tokens
/// plus concept dimensions, L2-normalised.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension < CONCEPTS.len() + 8 {
            anyhow::bail!(
                "Local embedder needs at least {} dimensions, got {}",
                CONCEPTS.len() + 8,
                dimension
            );
        }
        Ok(Self { dimension })
    }

    fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
            .filter(|t| t.chars().count() >= 2 && !STOPWORDS.contains(&t.as_str()))
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let digest = Sha256::digest(token.as_bytes());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        let hash = u64::from_le_bytes(raw);

        let span = (self.dimension - CONCEPTS.len()) as u64;
        let index = CONCEPTS.len() + (hash % span) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in Self::tokens(text) {
            let (index, sign) = self.bucket(&token);
            vector[index] += sign;

            for (concept, keywords) in CONCEPTS.iter().enumerate() {
                if keywords.contains(&token.as_str()) {
                    vector[concept] += CONCEPT_WEIGHT;
                }
            }
        }

        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
