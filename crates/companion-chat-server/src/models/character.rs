use serde::{Deserialize, Serialize};

/// Read-only profile served by the Character Profile Service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CharacterDetails {
    pub name: String,
    pub description: String,
    #[serde(default, alias = "personalityTraits")]
    pub personality_traits: Vec<String>,
    #[serde(default)]
    pub backstory: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    #[serde(alias = "voice_id")]
    pub voice_id: String,
}
