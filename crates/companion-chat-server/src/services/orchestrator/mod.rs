//! Response Orchestrator: drives the generative backend and derives signals.

mod responder;
pub mod signals;

pub use responder::{GeneratedResponse, GenerationRequest, OrchestratorEvent, ResponseOrchestrator};
pub use signals::{
    ActionExtractor, DelimitedActionExtractor, EmotionClassifier, KeywordEmotionClassifier,
    KeywordSignificanceScorer, SignalScorers, SignificanceScorer,
};
