use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{CatalogCharacter, CharactersConfig};
use crate::models::{CharacterDetails, VoiceConfig};

/// Character Profile collaborator. `None` means the character is unknown.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CharacterProfileProvider: Send + Sync {
    async fn get_character_details(&self, character_id: Uuid) -> Result<Option<CharacterDetails>>;

    async fn get_voice_config(&self, character_id: Uuid) -> Result<Option<VoiceConfig>>;
}

pub fn build_character_provider(config: &CharactersConfig) -> Result<Arc<dyn CharacterProfileProvider>> {
    Ok(match &config.base_url {
        Some(base_url) => Arc::new(HttpCharacterService::new(base_url.clone())?),
        None => Arc::new(StaticCharacterCatalog::new(config.catalog.clone())),
    })
}

/// Characters declared in configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCharacterCatalog {
    characters: HashMap<Uuid, CatalogCharacter>,
}

impl StaticCharacterCatalog {
    pub fn new(catalog: Vec<CatalogCharacter>) -> Self {
        Self {
            characters: catalog.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.characters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }
}

#[async_trait]
impl CharacterProfileProvider for StaticCharacterCatalog {
    async fn get_character_details(&self, character_id: Uuid) -> Result<Option<CharacterDetails>> {
        Ok(self.characters.get(&character_id).map(|c| c.details.clone()))
    }

    async fn get_voice_config(&self, character_id: Uuid) -> Result<Option<VoiceConfig>> {
        Ok(self
            .characters
            .get(&character_id)
            .and_then(|c| c.voice_id.clone())
            .map(|voice_id| VoiceConfig { voice_id }))
    }
}

/// REST client for a remote Character Profile Service.
#[derive(Clone)]
pub struct HttpCharacterService {
    client: Client,
    base_url: String,
}

impl HttpCharacterService {
    pub fn new(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_optional<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<Option<T>> {
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach character service at {}", url))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Character service error ({}): {}", status, body);
        }

        Ok(Some(response.json().await.context("Failed to parse character profile")?))
    }
}

#[async_trait]
impl CharacterProfileProvider for HttpCharacterService {
    async fn get_character_details(&self, character_id: Uuid) -> Result<Option<CharacterDetails>> {
        self.get_optional(format!("{}/characters/{}", self.base_url, character_id))
            .await
    }

    async fn get_voice_config(&self, character_id: Uuid) -> Result<Option<VoiceConfig>> {
        self.get_optional(format!("{}/characters/{}/voice", self.base_url, character_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_catalog_lookup() {
        let id = Uuid::new_v4();
        let catalog = StaticCharacterCatalog::new(vec![CatalogCharacter {
            id,
            details: CharacterDetails {
                name: "Aria".into(),
                description: "a cheerful astronomer".into(),
                personality_traits: vec!["curious".into()],
                backstory: None,
            },
            voice_id: Some("aria-v1".into()),
        }]);

        let details = catalog.get_character_details(id).await.unwrap().unwrap();
        assert_eq!(details.name, "Aria");
        assert_eq!(
            catalog.get_voice_config(id).await.unwrap(),
            Some(VoiceConfig { voice_id: "aria-v1".into() })
        );
        assert!(catalog.get_character_details(Uuid::new_v4()).await.unwrap().is_none());
    }
}
