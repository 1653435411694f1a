//! AI Provider implementations

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Supported AI providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AiProvider {
    #[default]
    Ollama,
    Anthropic,
    OpenAI,
}

impl std::str::FromStr for AiProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ollama" | "local" => Ok(AiProvider::Ollama),
            "anthropic" | "claude" => Ok(AiProvider::Anthropic),
            "openai" | "gpt" => Ok(AiProvider::OpenAI),
            _ => anyhow::bail!("Unknown AI provider: {}. Use 'ollama', 'anthropic' or 'openai'", s),
        }
    }
}

/// AI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    /// AI provider to use
    #[serde(default = "default_provider")]
    pub provider: String,
    /// API key (can use env var like ${ANTHROPIC_API_KEY})
    pub api_key: Option<String>,
    /// Model to use
    pub model: Option<String>,
    /// Base URL, mostly for a non-default Ollama host
    pub api_base: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Extra guidance appended to every prompt
    #[serde(default)]
    pub additional_instructions: String,
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.2
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            model: None,
            api_base: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            additional_instructions: String::new(),
        }
    }
}

const OLLAMA_DEFAULT_BASE: &str = "http://localhost:11434";

/// Request to the Ollama generate API
#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

/// Request to Anthropic Claude API
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    system: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Response from Anthropic Claude API
#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: String,
}

/// Request to OpenAI API
#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

/// Response from OpenAI API
#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageContent,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessageContent {
    content: String,
}

/// A system/user prompt pair
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// AI client for making API calls
pub struct AiClient {
    provider: AiProvider,
    api_key: Option<String>,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl AiClient {
    /// Create a new AI client from configuration
    pub fn new(config: &AiConfig) -> Result<Self> {
        let provider: AiProvider = config.provider.parse()?;

        // Get API key from config or environment
        let api_key = config
            .api_key
            .clone()
            .or_else(|| match provider {
                AiProvider::Ollama => None,
                AiProvider::Anthropic => std::env::var("ANTHROPIC_API_KEY").ok(),
                AiProvider::OpenAI => std::env::var("OPENAI_API_KEY").ok(),
            })
            .map(|key| expand_env(&key))
            .transpose()?;

        if provider != AiProvider::Ollama && api_key.is_none() {
            anyhow::bail!("API key not found. Set it in config or via environment variable");
        }

        let api_base = match (&config.api_base, provider) {
            (Some(base), _) => base.trim_end_matches('/').to_string(),
            (None, AiProvider::Ollama) => OLLAMA_DEFAULT_BASE.to_string(),
            (None, AiProvider::Anthropic) => "https://api.anthropic.com".to_string(),
            (None, AiProvider::OpenAI) => "https://api.openai.com".to_string(),
        };

        let model = config.model.clone().unwrap_or_else(|| match provider {
            AiProvider::Ollama => "codellama".to_string(),
            AiProvider::Anthropic => "claude-sonnet-4-20250514".to_string(),
            AiProvider::OpenAI => "gpt-4o".to_string(),
        });

        Ok(Self {
            provider,
            api_key,
            api_base,
            model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            client: reqwest::Client::new(),
        })
    }

    pub fn provider(&self) -> AiProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a prompt and return the raw completion text
    pub async fn complete(&self, prompt: &Prompt) -> Result<String> {
        let started = std::time::Instant::now();
        let text = match self.provider {
            AiProvider::Ollama => self.call_ollama(prompt).await,
            AiProvider::Anthropic => self.call_anthropic(prompt).await,
            AiProvider::OpenAI => self.call_openai(prompt).await,
        }?;

        tracing::info!(
            provider = ?self.provider,
            model = %self.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            prompt_bytes = prompt.system.len() + prompt.user.len(),
            response_bytes = text.len(),
            "completion received"
        );

        Ok(text)
    }

    async fn call_ollama(&self, prompt: &Prompt) -> Result<String> {
        let message = if prompt.system.is_empty() {
            prompt.user.clone()
        } else {
            format!("{}\n\n{}", prompt.system, prompt.user)
        };

        let request = OllamaRequest {
            model: self.model.clone(),
            prompt: message,
            stream: false,
            options: OllamaOptions {
                num_predict: self.max_tokens,
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.api_base))
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to call Ollama at {}", self.api_base))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama API error ({}): {}", status, error_text);
        }

        let result: OllamaResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        Ok(result.response)
    }

    async fn call_anthropic(&self, prompt: &Prompt) -> Result<String> {
        let request = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system: prompt.system.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.user.clone(),
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", self.api_key.as_deref().unwrap_or_default())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .context("Failed to call Anthropic API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Anthropic API error ({}): {}", status, error_text);
        }

        let result: AnthropicResponse = response
            .json()
            .await
            .context("Failed to parse Anthropic response")?;

        result
            .content
            .first()
            .map(|c| c.text.clone())
            .context("Empty response from Anthropic")
    }

    async fn call_openai(&self, prompt: &Prompt) -> Result<String> {
        let mut messages = Vec::new();
        if !prompt.system.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: prompt.system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: prompt.user.clone(),
        });

        let request = OpenAIRequest {
            model: self.model.clone(),
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.api_base))
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.as_deref().unwrap_or_default()),
            )
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .context("Failed to call OpenAI API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error ({}): {}", status, error_text);
        }

        let result: OpenAIResponse = response
            .json()
            .await
            .context("Failed to parse OpenAI response")?;

        result
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .context("Empty response from OpenAI")
    }
}

/// Expand `${VAR}` / `$VAR` references in a configured secret
fn expand_env(value: &str) -> Result<String> {
    shellexpand::env(value)
        .map(|expanded| expanded.into_owned())
        .with_context(|| format!("Failed to expand environment variables in '{}'", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parsing() {
        assert_eq!("ollama".parse::<AiProvider>().unwrap(), AiProvider::Ollama);
        assert_eq!("anthropic".parse::<AiProvider>().unwrap(), AiProvider::Anthropic);
        assert_eq!("claude".parse::<AiProvider>().unwrap(), AiProvider::Anthropic);
        assert_eq!("openai".parse::<AiProvider>().unwrap(), AiProvider::OpenAI);
        assert_eq!("gpt".parse::<AiProvider>().unwrap(), AiProvider::OpenAI);
        assert!("bard".parse::<AiProvider>().is_err());
    }

    #[test]
    fn test_ollama_client_needs_no_key() {
        let client = AiClient::new(&AiConfig::default()).unwrap();
        assert_eq!(client.provider(), AiProvider::Ollama);
        assert_eq!(client.model(), "codellama");
        assert_eq!(client.api_base, OLLAMA_DEFAULT_BASE);
    }

    #[test]
    fn test_api_key_expansion() {
        std::env::set_var("COVGEN_TEST_API_KEY", "sk-test");
        let config = AiConfig {
            provider: "openai".to_string(),
            api_key: Some("${COVGEN_TEST_API_KEY}".to_string()),
            api_base: Some("http://localhost:9999/".to_string()),
            ..AiConfig::default()
        };

        let client = AiClient::new(&config).unwrap();
        assert_eq!(client.api_key.as_deref(), Some("sk-test"));
        assert_eq!(client.api_base, "http://localhost:9999");
    }
}
