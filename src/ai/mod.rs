//! AI module for test generation
//!
//! Provides:
//! - Support for multiple AI providers (Ollama, Anthropic, OpenAI)
//! - Prompt construction from source, tests, coverage gaps and rejected attempts
//! - Extraction of candidate tests from model replies

mod generator;
mod prompt;
mod providers;

pub use generator::LlmCandidateSource;
pub use prompt::{build_generation_prompt, detect_language, extract_candidates};
pub use providers::{AiClient, AiConfig, AiProvider, Prompt};
