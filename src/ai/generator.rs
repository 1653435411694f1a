//! Candidate source backed by a language model

use anyhow::{Context, Result};

use super::prompt::{build_generation_prompt, extract_candidates};
use super::providers::{AiClient, AiConfig};
use crate::agent::{CandidateSource, GenerationContext};

/// Asks the configured model for new tests each iteration
pub struct LlmCandidateSource {
    client: AiClient,
    runtime: tokio::runtime::Runtime,
    additional_instructions: String,
}

impl LlmCandidateSource {
    pub fn new(config: &AiConfig) -> Result<Self> {
        let client = AiClient::new(config)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start async runtime for AI client")?;

        Ok(Self {
            client,
            runtime,
            additional_instructions: config.additional_instructions.clone(),
        })
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }
}

impl CandidateSource for LlmCandidateSource {
    fn generate(&mut self, ctx: &GenerationContext<'_>) -> Result<Vec<String>> {
        let prompt = build_generation_prompt(ctx, &self.additional_instructions);
        let response = self.runtime.block_on(self.client.complete(&prompt))?;
        let candidates = extract_candidates(&response, ctx.max_tests);

        tracing::debug!(count = candidates.len(), "candidates extracted from completion");
        Ok(candidates)
    }
}
