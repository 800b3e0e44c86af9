//! Scorers that derive structured signals from generated text. Each sits
//! behind a trait so a learned model can replace the keyword version.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::models::{ActionData, EmotionData};

pub trait EmotionClassifier: Send + Sync {
    fn classify(&self, text: &str) -> EmotionData;
}

pub trait ActionExtractor: Send + Sync {
    fn extract(&self, text: &str) -> Option<ActionData>;
}

pub trait SignificanceScorer: Send + Sync {
    fn is_significant(&self, user_text: &str, assistant_text: &str) -> bool;
}

/// The scorers used by the orchestrator.
#[derive(Clone)]
pub struct SignalScorers {
    pub emotion: Arc<dyn EmotionClassifier>,
    pub action: Arc<dyn ActionExtractor>,
    pub significance: Arc<dyn SignificanceScorer>,
}

impl Default for SignalScorers {
    fn default() -> Self {
        Self {
            emotion: Arc::new(KeywordEmotionClassifier),
            action: Arc::new(DelimitedActionExtractor::default()),
            significance: Arc::new(KeywordSignificanceScorer::default()),
        }
    }
}

// ===== EMOTION =====

const EMOTION_LEXICON: &[(&str, &str, &[&str])] = &[
    ("joy", "smile", &["happy", "glad", "great", "wonderful", "haha", "yay", "excited", "delighted", "fun"]),
    ("affection", "warm_smile", &["love", "dear", "sweet", "care", "adore", "hug"]),
    ("sadness", "frown", &["sad", "sorry", "unfortunately", "miss", "lonely", "cry"]),
    ("anger", "scowl", &["angry", "annoyed", "furious", "hate", "mad"]),
    ("fear", "wide_eyes", &["afraid", "scared", "worried", "nervous", "anxious"]),
    ("surprise", "raised_brows", &["wow", "really", "surprised", "amazing", "whoa"]),
];

/// Lexicon hit counts per emotion, `neutral` when nothing matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordEmotionClassifier;

impl EmotionClassifier for KeywordEmotionClassifier {
    fn classify(&self, text: &str) -> EmotionData {
        let lower = text.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        let hits: Vec<(&str, &str, usize)> = EMOTION_LEXICON
            .iter()
            .map(|(label, expression, keywords)| {
                let n = words.iter().filter(|w| keywords.contains(w)).count();
                (*label, *expression, n)
            })
            .collect();

        let total: usize = hits.iter().map(|(_, _, n)| n).sum();
        if total == 0 {
            return EmotionData {
                primary: "neutral".to_string(),
                intensity: 0.5,
                expression: Some("neutral".to_string()),
                scores: BTreeMap::from([("neutral".to_string(), 1.0)]),
            };
        }

        // First label wins ties.
        let (primary, expression, top) = hits
            .iter()
            .fold(hits[0], |best, cur| if cur.2 > best.2 { *cur } else { best });

        let scores = hits
            .iter()
            .filter(|(_, _, n)| *n > 0)
            .map(|(label, _, n)| (label.to_string(), *n as f32 / total as f32))
            .collect();

        EmotionData {
            primary: primary.to_string(),
            intensity: (0.4 + 0.2 * top as f32).min(1.0),
            expression: Some(expression.to_string()),
            scores,
        }
    }
}

// ===== ACTION =====

/// The span between the first and last marker, e.g. `*waves happily*`.
#[derive(Debug, Clone)]
pub struct DelimitedActionExtractor {
    pub marker: char,
    pub action_type: String,
    pub duration_seconds: f32,
}

impl Default for DelimitedActionExtractor {
    fn default() -> Self {
        Self {
            marker: '*',
            action_type: "gesture".to_string(),
            duration_seconds: 3.0,
        }
    }
}

impl ActionExtractor for DelimitedActionExtractor {
    fn extract(&self, text: &str) -> Option<ActionData> {
        let first = text.find(self.marker)?;
        let last = text.rfind(self.marker)?;
        if last <= first {
            return None;
        }

        let description = text[first + self.marker.len_utf8()..last].trim();
        if description.is_empty() {
            return None;
        }

        Some(ActionData {
            description: description.to_string(),
            action_type: self.action_type.clone(),
            duration_seconds: self.duration_seconds,
        })
    }
}

// ===== SIGNIFICANCE =====

pub const SIGNIFICANCE_KEYWORDS: &[&str] = &[
    "love",
    "hate",
    "important",
    "remember",
    "never forget",
    "always",
    "promise",
    "secret",
    "confession",
    "truth",
];

/// Case-insensitive keyword hit over the combined exchange.
#[derive(Debug, Clone)]
pub struct KeywordSignificanceScorer {
    keywords: Vec<String>,
}

impl Default for KeywordSignificanceScorer {
    fn default() -> Self {
        Self {
            keywords: SIGNIFICANCE_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl SignificanceScorer for KeywordSignificanceScorer {
    fn is_significant(&self, user_text: &str, assistant_text: &str) -> bool {
        let combined = format!("{} {}", user_text, assistant_text).to_lowercase();
        self.keywords.iter().any(|k| combined.contains(k.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_between_first_and_last_marker() {
        let extractor = DelimitedActionExtractor::default();
        let action = extractor
            .extract("Hello! *waves* and *smiles warmly* How are you?")
            .unwrap();
        assert_eq!(action.description, "waves* and *smiles warmly");
        assert_eq!(action.action_type, "gesture");
        assert_eq!(action.duration_seconds, 3.0);

        assert!(extractor.extract("no markers here").is_none());
        assert!(extractor.extract("only *one marker").is_none());
        assert!(extractor.extract("empty ** span").is_none());
    }

    #[test]
    fn test_significance_is_case_insensitive() {
        let scorer = KeywordSignificanceScorer::default();
        assert!(scorer.is_significant("I will NEVER FORGET this", "ok"));
        assert!(scorer.is_significant("hi", "I Promise."));
        assert!(!scorer.is_significant("what's the weather", "sunny"));
    }

    #[test]
    fn test_emotion_classification() {
        let classifier = KeywordEmotionClassifier;
        let neutral = classifier.classify("The meeting is at noon.");
        assert_eq!(neutral.primary, "neutral");

        let joy = classifier.classify("I'm so happy, this is great!");
        assert_eq!(joy.primary, "joy");
        assert!((joy.intensity - 0.8).abs() < 1e-6);
        assert_eq!(joy.scores.get("joy"), Some(&1.0));

        let mixed = classifier.classify("I'm sad but glad you're here");
        assert_eq!(mixed.primary, "joy");
        assert_eq!(mixed.scores.len(), 2);
    }
}
