// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! LLM client abstraction for judged metrics

use async_trait::async_trait;
use convoeval_core::{JudgeConfig, JudgeProvider};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const SYSTEM_PROMPT: &str = "You are an expert evaluator. Respond only with valid JSON.";

/// Trait for LLM clients used as judges
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a prompt and get a JSON response
    async fn evaluate(&self, prompt: String) -> Result<LlmResponse, LlmError>;

    /// Get model name
    fn model_name(&self) -> &str;
}

/// Response from LLM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// Token usage information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Errors from LLM clients
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Judge not configured: {0}")]
    NotConfigured(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn chat_request(model: Option<&str>, prompt: &str) -> serde_json::Value {
    let mut request = serde_json::json!({
        "messages": [
            { "role": "system", "content": SYSTEM_PROMPT },
            { "role": "user", "content": prompt }
        ],
        "temperature": 0.0,
        "response_format": { "type": "json_object" }
    });
    if let Some(model) = model {
        request["model"] = serde_json::Value::String(model.to_string());
    }
    request
}

async fn read_chat_response(
    response: reqwest::Response,
    model: &str,
) -> Result<LlmResponse, LlmError> {
    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await?;
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimitExceeded);
        }
        return Err(LlmError::ApiError(format!("{}: {}", status, error_text)));
    }

    let response_data: serde_json::Value = response.json().await?;

    let content = response_data["choices"][0]["message"]["content"]
        .as_str()
        .ok_or(LlmError::InvalidResponse("Missing content".to_string()))?
        .to_string();

    let usage_data = &response_data["usage"];
    let usage = TokenUsage {
        prompt_tokens: usage_data["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: usage_data["completion_tokens"].as_u64().unwrap_or(0) as u32,
        total_tokens: usage_data["total_tokens"].as_u64().unwrap_or(0) as u32,
    };

    Ok(LlmResponse {
        content,
        usage,
        model: model.to_string(),
    })
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, LlmError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// OpenAI-compatible chat completions client
pub struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, LlmError> {
        self.client = http_client(timeout)?;
        Ok(self)
    }
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn evaluate(&self, prompt: String) -> Result<LlmResponse, LlmError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&chat_request(Some(&self.model), &prompt))
            .send()
            .await?;

        read_chat_response(response, &self.model).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Azure OpenAI chat completions client, addressed by deployment
pub struct AzureOpenAIClient {
    api_key: String,
    endpoint: String,
    deployment: String,
    api_version: String,
    client: reqwest::Client,
}

impl AzureOpenAIClient {
    pub fn new(endpoint: String, api_key: String, deployment: String, api_version: String) -> Self {
        Self {
            api_key,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            deployment,
            api_version,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, LlmError> {
        self.client = http_client(timeout)?;
        Ok(self)
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, self.deployment, self.api_version
        )
    }
}

#[async_trait]
impl LlmClient for AzureOpenAIClient {
    async fn evaluate(&self, prompt: String) -> Result<LlmResponse, LlmError> {
        let response = self
            .client
            .post(self.completions_url())
            .header("api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&chat_request(None, &prompt))
            .send()
            .await?;

        read_chat_response(response, &self.deployment).await
    }

    fn model_name(&self) -> &str {
        &self.deployment
    }
}

/// Build the judge client described by `config`
pub fn client_from_config(config: &JudgeConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    let api_key = config
        .api_key
        .clone()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| LlmError::NotConfigured("judge.api_key is not set".to_string()))?;
    let timeout = Duration::from_secs(config.request_timeout_secs.max(1));

    match config.provider {
        JudgeProvider::AzureOpenai => {
            let endpoint = config.endpoint.clone().ok_or_else(|| {
                LlmError::NotConfigured("judge.endpoint is not set".to_string())
            })?;
            let client = AzureOpenAIClient::new(
                endpoint,
                api_key,
                config.deployment.clone(),
                config.api_version.clone(),
            )
            .with_timeout(timeout)?;
            Ok(Arc::new(client))
        }
        JudgeProvider::Openai => {
            let mut client = OpenAIClient::new(api_key, config.deployment.clone());
            if let Some(endpoint) = &config.endpoint {
                client = client.with_base_url(endpoint.clone());
            }
            Ok(Arc::new(client.with_timeout(timeout)?))
        }
    }
}
