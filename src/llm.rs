use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{Engine, JobConfig};
use crate::error::FillError;

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_OLLAMA_BASE: &str = "http://localhost:11434";
const MAPPING_TEMPERATURE: f32 = 0.1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// The model boundary. Implementations are opaque to the engine: whatever
/// comes back is treated as untrusted text and handed to the resolver.
/// Transport failures surface as `MappingUnavailable`.
pub trait LlmClient {
    fn chat(&self, messages: &[ChatMessage]) -> Result<String, FillError>;
}

pub fn client_from_config(cfg: &JobConfig) -> Result<Box<dyn LlmClient>, FillError> {
    match cfg.engine {
        Engine::Api => Ok(Box::new(ApiClient::new(cfg)?)),
        Engine::Ollama => Ok(Box::new(OllamaClient::new(cfg)?)),
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::blocking::Client, FillError> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| FillError::Config(format!("http client: {e}")))
}

// ---------------------------------------------------------------------------
// OpenAI-compatible endpoint
// ---------------------------------------------------------------------------

pub struct ApiClient {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

impl ApiClient {
    pub fn new(cfg: &JobConfig) -> Result<Self, FillError> {
        let api_key = cfg
            .api_key
            .clone()
            .ok_or_else(|| FillError::Config("engine \"api\" requires api_key".to_string()))?;
        Ok(Self {
            client: http_client(cfg.timeout_secs)?,
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: cfg.model.clone(),
        })
    }
}

impl LlmClient for ApiClient {
    fn chat(&self, messages: &[ChatMessage]) -> Result<String, FillError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: MAPPING_TEMPERATURE,
        };
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .map_err(|e| FillError::MappingUnavailable(format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(FillError::MappingUnavailable(format!(
                "{url}: {status}: {body}"
            )));
        }
        let parsed: ChatCompletionResponse = response
            .json()
            .map_err(|e| FillError::MappingUnavailable(format!("decode response: {e}")))?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Ollama
// ---------------------------------------------------------------------------

pub struct OllamaClient {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

impl OllamaClient {
    pub fn new(cfg: &JobConfig) -> Result<Self, FillError> {
        Ok(Self {
            client: http_client(cfg.timeout_secs)?,
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: cfg.model.clone(),
        })
    }
}

impl LlmClient for OllamaClient {
    fn chat(&self, messages: &[ChatMessage]) -> Result<String, FillError> {
        let url = format!("{}/api/chat", self.base_url);
        let request = OllamaChatRequest {
            model: &self.model,
            messages,
            stream: false,
            options: OllamaOptions {
                temperature: MAPPING_TEMPERATURE,
            },
        };
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .map_err(|e| FillError::MappingUnavailable(format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(FillError::MappingUnavailable(format!(
                "{url}: {status}: {body}"
            )));
        }
        let parsed: OllamaChatResponse = response
            .json()
            .map_err(|e| FillError::MappingUnavailable(format!("decode response: {e}")))?;
        Ok(parsed.message.content)
    }
}
