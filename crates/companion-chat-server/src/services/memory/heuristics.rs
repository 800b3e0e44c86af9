use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::models::{MemoryCategory, BASE_IMPORTANCE};

/// A memory derived from an exchange, before embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryCandidate {
    pub content: String,
    pub category: MemoryCategory,
    pub importance: f64,
}

/// Decides what is worth remembering and how much it matters.
pub trait MemoryHeuristics: Send + Sync {
    /// Memory text for an exchange, `None` when nothing is memory-worthy.
    fn extract_content(&self, user_text: &str, assistant_text: &str) -> Option<String>;

    fn categorize(&self, content: &str) -> MemoryCategory;

    /// Always within [0, 1].
    fn importance(&self, content: &str) -> f64;

    fn candidate(&self, user_text: &str, assistant_text: &str) -> Option<MemoryCandidate> {
        let content = self.extract_content(user_text, assistant_text)?;
        Some(MemoryCandidate {
            category: self.categorize(&content),
            importance: self.importance(&content),
            content,
        })
    }
}

/// Matched against the raw text, so the captured name keeps its original casing.
static NAME_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)\bmy\s+name\s+is\s+(.+)")
        .map_err(|e| warn!("Name pattern failed to compile: {}", e))
        .ok()
});

const PREFERENCE_MARKERS: &[&str] = &["i like", "i love"];
const ACKNOWLEDGEMENTS: &[&str] = &["i'll remember", "i will remember", "noted"];

const FACT_WORDS: &[&str] = &["name", "age", "location"];
const PREFERENCE_WORDS: &[&str] = &[
    "like", "love", "enjoy", "prefer", "preference", "favorite", "favourite",
];
const EVENT_WORDS: &[&str] = &["happened", "did", "went"];

pub const IMPORTANCE_KEYWORDS: &[&str] = &["always", "never", "important", "remember", "love", "hate"];

fn normalize(text: &str) -> String {
    text.replace('\u{2019}', "'").to_lowercase()
}

fn has_word(text: &str, words: &[&str]) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .any(|w| words.contains(&w))
}

/// Phrase and keyword rules over the raw exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordMemoryHeuristics;

impl MemoryHeuristics for KeywordMemoryHeuristics {
    fn extract_content(&self, user_text: &str, assistant_text: &str) -> Option<String> {
        let user = normalize(user_text);
        let assistant = normalize(assistant_text);

        let name = NAME_PATTERN
            .as_ref()
            .and_then(|re| re.captures(user_text))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().trim_end_matches(&['.', '!', '?'][..]).trim_end());
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            return Some(format!("User's name: {}", name));
        }

        if PREFERENCE_MARKERS.iter().any(|m| user.contains(m)) {
            return Some(format!("User preference: {}", user_text.trim()));
        }

        if ACKNOWLEDGEMENTS.iter().any(|m| assistant.contains(m)) {
            return Some(format!("Important: {}", user_text.trim()));
        }

        None
    }

    fn categorize(&self, content: &str) -> MemoryCategory {
        let text = normalize(content);
        if has_word(&text, FACT_WORDS) {
            MemoryCategory::Fact
        } else if has_word(&text, PREFERENCE_WORDS) {
            MemoryCategory::Preference
        } else if has_word(&text, EVENT_WORDS) {
            MemoryCategory::Event
        } else {
            MemoryCategory::General
        }
    }

    fn importance(&self, content: &str) -> f64 {
        let text = normalize(content);
        let hits = IMPORTANCE_KEYWORDS.iter().filter(|k| text.contains(*k)).count();
        // Tenths keep 0.5 + 0.3 exact.
        let tenths = (BASE_IMPORTANCE * 10.0).round() as usize + hits;
        tenths.min(10) as f64 / 10.0
    }
}
