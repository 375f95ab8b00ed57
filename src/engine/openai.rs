use super::{types::*, InferenceClient};
use crate::{
    config::Config,
    request::{Message, RequestDescriptor},
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Chat-completions client for OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let api_key = resolve_api_key(cfg)?;
        let mut builder = Client::builder();
        if cfg.api.request_timeout_seconds > 0 {
            builder = builder.timeout(Duration::from_secs(cfg.api.request_timeout_seconds));
        }
        let client = builder.build().with_context(|| "building HTTP client")?;
        let base_url = cfg.api.base_url.trim_end_matches('/').to_string();
        info!("inference endpoint {}", base_url);
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }
}

/// Reads the credential from the configured environment variable, falling
/// back to the first value line of the configured key file.
pub fn resolve_api_key(cfg: &Config) -> Result<String> {
    if !cfg.api.api_key_env.is_empty() {
        if let Ok(key) = std::env::var(&cfg.api.api_key_env) {
            let key = key.trim();
            if !key.is_empty() {
                return Ok(key.to_string());
            }
        }
    }

    if !cfg.api.api_key_file.is_empty() {
        return read_key_file(Path::new(&cfg.api.api_key_file));
    }

    Err(anyhow!(
        "no API key: set {} or api.api_key_file",
        cfg.api.api_key_env
    ))
}

pub fn read_key_file(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading API key file: {}", path.display()))?;
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case("api_key"))
        .map(|l| l.split(',').next().unwrap_or(l).trim().to_string())
        .find(|k| !k.is_empty())
        .ok_or_else(|| anyhow!("no API key found in {}", path.display()))
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    response_format: &'a Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

#[async_trait]
impl InferenceClient for OpenAiClient {
    async fn invoke(&self, req: &RequestDescriptor) -> Result<InferenceResponse, InvokeError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_completion_tokens: req.max_completion_tokens,
            response_format: &req.response_format,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InvokeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let chat: ChatResponse = response.json().await?;
        let usage = chat
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                cached_input_tokens: u
                    .prompt_tokens_details
                    .map(|d| d.cached_tokens)
                    .unwrap_or(0),
                output_tokens: u.completion_tokens,
            })
            .ok_or_else(|| InvokeError::Malformed("response has no usage block".into()))?;
        let choice = chat
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| InvokeError::Malformed("response has no choices".into()))?;

        debug!(
            record_id = req.record_id,
            finish_reason = ?choice.finish_reason,
            refusal = ?choice.message.refusal,
            content_len = choice.message.content.as_deref().map(str::len).unwrap_or(0),
            "completion received"
        );

        Ok(InferenceResponse {
            content: choice.message.content,
            finish_reason: choice.finish_reason,
            refusal: choice.message.refusal,
            usage,
        })
    }
}
