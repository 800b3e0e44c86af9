use crate::models::{
    CharacterContext, CharacterDetails, ConversationSettings, Message, MessageRole, ScoredMemory,
};
use crate::services::llm_service::ChatMessage;

/// Everything the assembler reads for one turn.
pub struct PromptInputs<'a> {
    pub character: &'a CharacterDetails,
    pub settings: &'a ConversationSettings,
    pub character_context: &'a CharacterContext,
    /// Trailing window, oldest first, excluding the current message.
    pub history: &'a [Message],
    pub current: &'a Message,
    pub memories: &'a [ScoredMemory],
    pub preferred_tone: Option<&'a str>,
    pub include_actions: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    pub system: String,
    /// History in role order, then the current user message.
    pub messages: Vec<ChatMessage>,
}

/// Builds the generation prompt. Section order is fixed; empty optional
/// sections are left out entirely.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    default_style: String,
    shared_memories_in_prompt: usize,
}

impl ContextBuilder {
    pub fn new(default_style: String, shared_memories_in_prompt: usize) -> Self {
        Self {
            default_style,
            shared_memories_in_prompt,
        }
    }

    pub fn assemble(&self, inputs: &PromptInputs<'_>) -> AssembledPrompt {
        let mut sections: Vec<String> = Vec::new();

        // (a) identity and traits
        let character = inputs.character;
        let mut identity = format!("You are {}, {}.", character.name, character.description.trim_end_matches('.'));
        if !character.personality_traits.is_empty() {
            identity.push_str(&format!(
                "\nPersonality traits: {}.",
                character.personality_traits.join(", ")
            ));
        }
        sections.push(identity);

        // (b) backstory
        if let Some(backstory) = character.backstory.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
            sections.push(format!("Backstory: {}", backstory));
        }

        // (c) response style
        let style = inputs
            .settings
            .response_style
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.default_style);
        let mut directive = format!("Respond in a {} style.", style);
        if let Some(tone) = inputs.preferred_tone.filter(|t| !t.trim().is_empty()) {
            directive.push_str(&format!(" Use a {} tone.", tone));
        }
        if let Some(language) = inputs.settings.language.as_deref().filter(|l| !l.trim().is_empty()) {
            directive.push_str(&format!(" Reply in {}.", language));
        }
        sections.push(directive);

        // (d) relationship and shared memories
        let ctx = inputs.character_context;
        if ctx.relationship_strength > 0 {
            let mut relationship = format!(
                "Relationship: you have shared {} conversation turns with this user.",
                ctx.relationship_strength
            );
            let shared = ctx.recent_shared(self.shared_memories_in_prompt);
            if !shared.is_empty() {
                relationship.push_str("\nShared memories:");
                for memory in shared {
                    relationship.push_str(&format!("\n- {}", memory));
                }
            }
            sections.push(relationship);
        }

        // retrieved memories
        if !inputs.memories.is_empty() {
            let mut recalled = String::from("Things you remember about the user:");
            for scored in inputs.memories {
                recalled.push_str(&format!("\n- {}", scored.memory.content));
            }
            sections.push(recalled);
        }

        let mut closing = String::from(
            "Stay in character at all times and keep the conversation natural.",
        );
        if inputs.include_actions {
            closing.push_str(" You may describe one physical action between asterisks, like *smiles*.");
        }
        sections.push(closing);

        // (e) history, (f) current message
        let messages = inputs
            .history
            .iter()
            .chain(std::iter::once(inputs.current))
            .map(|m| ChatMessage::new(role_name(m.role), m.content.clone()))
            .collect();

        AssembledPrompt {
            system: sections.join("\n\n"),
            messages,
        }
    }
}

fn role_name(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Memory, MemoryCategory, MessageMetadata, MessageType};
    use uuid::Uuid;

    fn aria() -> CharacterDetails {
        CharacterDetails {
            name: "Aria".into(),
            description: "a cheerful astronomer".into(),
            personality_traits: vec!["curious".into(), "warm".into()],
            backstory: Some("Grew up under dark skies.".into()),
        }
    }

    #[test]
    fn test_sections_in_fixed_order() {
        let conv_id = Uuid::new_v4();
        let mut ctx = CharacterContext::new(Uuid::new_v4(), Uuid::new_v4());
        ctx.relationship_strength = 3;
        ctx.push_shared((0..7).map(|i| format!("shared {}", i)), 100);

        let history = vec![
            Message::user(conv_id, "hi", MessageType::Text),
            Message::assistant(conv_id, "hello!", MessageMetadata::default()),
        ];
        let current = Message::user(conv_id, "what's new?", MessageType::Text);
        let memories = vec![ScoredMemory {
            memory: Memory::new(ctx.user_id, ctx.character_id, "User's name: Alex", vec![], MemoryCategory::Fact, 0.5),
            similarity: 0.9,
        }];
        let settings = ConversationSettings {
            response_style: Some("playful".into()),
            ..Default::default()
        };

        let builder = ContextBuilder::new("friendly".into(), 5);
        let prompt = builder.assemble(&PromptInputs {
            character: &aria(),
            settings: &settings,
            character_context: &ctx,
            history: &history,
            current: &current,
            memories: &memories,
            preferred_tone: None,
            include_actions: true,
        });

        let s = &prompt.system;
        let order = [
            s.find("You are Aria, a cheerful astronomer.").unwrap(),
            s.find("Personality traits: curious, warm.").unwrap(),
            s.find("Backstory: Grew up under dark skies.").unwrap(),
            s.find("Respond in a playful style.").unwrap(),
            s.find("Relationship:").unwrap(),
            s.find("Things you remember").unwrap(),
        ];
        assert!(order.windows(2).all(|w| w[0] < w[1]));

        // Only the last five shared memories.
        assert!(!s.contains("shared 1"));
        assert!(s.contains("shared 2") && s.contains("shared 6"));

        let roles: Vec<_> = prompt.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        assert_eq!(prompt.messages[2].content, "what's new?");
    }

    #[test]
    fn test_optional_sections_omitted() {
        let mut character = aria();
        character.backstory = None;
        character.personality_traits.clear();
        let ctx = CharacterContext::new(Uuid::new_v4(), Uuid::new_v4());
        let current = Message::user(Uuid::new_v4(), "hey", MessageType::Text);

        let prompt = ContextBuilder::new("friendly".into(), 5).assemble(&PromptInputs {
            character: &character,
            settings: &ConversationSettings::default(),
            character_context: &ctx,
            history: &[],
            current: &current,
            memories: &[],
            preferred_tone: Some("calm"),
            include_actions: false,
        });

        assert!(!prompt.system.contains("Backstory"));
        assert!(!prompt.system.contains("Personality traits"));
        assert!(!prompt.system.contains("Relationship"));
        assert!(!prompt.system.contains("remember"));
        assert!(!prompt.system.contains("asterisks"));
        assert!(prompt.system.contains("Respond in a friendly style. Use a calm tone."));
        assert!(!prompt.system.contains("\n\n\n"));
        assert_eq!(prompt.messages.len(), 1);
    }
}
