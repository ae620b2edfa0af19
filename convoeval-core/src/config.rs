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

//! Engine configuration
//!
//! Loaded with priority file > environment > defaults. Environment variables
//! are only read here; the rest of the workspace receives an explicit
//! [`EngineConfig`].

use crate::run::RunConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Which judge API the client speaks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JudgeProvider {
    #[default]
    AzureOpenai,
    Openai,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub judge: JudgeConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub defaults: RunConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    #[serde(default)]
    pub provider: JudgeProvider,

    /// Azure resource endpoint, or an OpenAI-compatible base URL
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Azure deployment name, or model name for the OpenAI provider
    #[serde(default = "default_deployment")]
    pub deployment: String,

    #[serde(default = "default_judge_api_version")]
    pub api_version: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub environment_id: Option<String>,

    /// Schema name of the agent
    #[serde(default)]
    pub agent_identifier: Option<String>,

    /// Overrides the host derived from the environment id
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_agent_api_version")]
    pub api_version: String,

    /// Seconds of silence after which the agent's turn is considered over
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tenant_id: Option<String>,

    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub client_secret: Option<String>,

    /// Pre-acquired bearer token; skips the client credentials flow
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_scope")]
    pub scope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_deployment() -> String {
    "gpt-4o".to_string()
}

fn default_judge_api_version() -> String {
    "2024-10-21".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_agent_api_version() -> String {
    "2022-03-01-preview".to_string()
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_scope() -> String {
    "https://api.powerplatform.com/.default".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./convoeval-data")
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            provider: JudgeProvider::default(),
            endpoint: None,
            api_key: None,
            deployment: default_deployment(),
            api_version: default_judge_api_version(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            environment_id: None,
            agent_identifier: None,
            base_url: None,
            api_version: default_agent_api_version(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            tenant_id: None,
            client_id: None,
            client_secret: None,
            token: None,
            scope: default_scope(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Supported environment variables:
    /// - AZURE_OPENAI_ENDPOINT, AZURE_OPENAI_API_KEY
    /// - AZURE_OPENAI_DEPLOYMENT_NAME, AZURE_OPENAI_API_VERSION
    /// - COPILOT_ENVIRONMENT_ID, COPILOT_AGENT_IDENTIFIER
    /// - AZURE_AD_TENANT_ID, AZURE_AD_CLIENT_ID, AZURE_AD_CLIENT_SECRET
    /// - CONVOEVAL_DATA_DIR
    pub fn from_env() -> Self {
        Self::default().merge_with(|key| std::env::var(key).ok())
    }

    /// Load configuration with priority: file > env > defaults
    pub fn load(config_file: Option<PathBuf>) -> Result<Self, ConfigError> {
        let file_config = match config_file {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from file: {:?}", path);
                Some(Self::from_file(&path)?)
            }
            Some(path) => {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                None
            }
            None => None,
        };

        let config = Self::default().merge_with(|key| std::env::var(key).ok());
        Ok(match file_config {
            Some(file) => file.fill_from(config),
            None => config,
        })
    }

    /// Apply variables returned by `lookup` on top of `self`
    pub fn merge_with<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |target: &mut Option<String>, key: &str| {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                *target = Some(value);
            }
        };

        set(&mut self.judge.endpoint, "AZURE_OPENAI_ENDPOINT");
        set(&mut self.judge.api_key, "AZURE_OPENAI_API_KEY");
        set(&mut self.agent.environment_id, "COPILOT_ENVIRONMENT_ID");
        set(&mut self.agent.agent_identifier, "COPILOT_AGENT_IDENTIFIER");
        set(&mut self.auth.tenant_id, "AZURE_AD_TENANT_ID");
        set(&mut self.auth.client_id, "AZURE_AD_CLIENT_ID");
        set(&mut self.auth.client_secret, "AZURE_AD_CLIENT_SECRET");

        if let Some(deployment) = lookup("AZURE_OPENAI_DEPLOYMENT_NAME") {
            self.judge.deployment = deployment;
        }
        if let Some(version) = lookup("AZURE_OPENAI_API_VERSION") {
            self.judge.api_version = version;
        }
        if let Some(dir) = lookup("CONVOEVAL_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }

        self
    }

    /// Fill settings the file left unset from `fallback`
    fn fill_from(mut self, fallback: Self) -> Self {
        fn fill(target: &mut Option<String>, fallback: Option<String>) {
            if target.is_none() {
                *target = fallback;
            }
        }

        fill(&mut self.judge.endpoint, fallback.judge.endpoint);
        fill(&mut self.judge.api_key, fallback.judge.api_key);
        fill(&mut self.agent.environment_id, fallback.agent.environment_id);
        fill(&mut self.agent.agent_identifier, fallback.agent.agent_identifier);
        fill(&mut self.auth.tenant_id, fallback.auth.tenant_id);
        fill(&mut self.auth.client_id, fallback.auth.client_id);
        fill(&mut self.auth.client_secret, fallback.auth.client_secret);
        self
    }

    /// Check the judge settings needed to build a judge client
    pub fn validate_judge(&self) -> Result<(), ConfigError> {
        if self.judge.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Missing("judge.api_key"));
        }
        if self.judge.provider == JudgeProvider::AzureOpenai && self.judge.endpoint.is_none() {
            return Err(ConfigError::Missing("judge.endpoint"));
        }
        if self.judge.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "judge.request_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Check the agent and auth settings needed to build a driver
    pub fn validate_agent(&self) -> Result<(), ConfigError> {
        if self.agent.environment_id.is_none() && self.agent.base_url.is_none() {
            return Err(ConfigError::Missing("agent.environment_id"));
        }
        if self.agent.agent_identifier.is_none() {
            return Err(ConfigError::Missing("agent.agent_identifier"));
        }
        if self.auth.token.is_none() {
            if self.auth.tenant_id.is_none() {
                return Err(ConfigError::Missing("auth.tenant_id"));
            }
            if self.auth.client_id.is_none() {
                return Err(ConfigError::Missing("auth.client_id"));
            }
            if self.auth.client_secret.is_none() {
                return Err(ConfigError::Missing("auth.client_secret"));
            }
        }
        Ok(())
    }

    /// Validate everything needed to execute a run
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_judge()?;
        self.validate_agent()?;
        if !(0.0..=1.0).contains(&self.defaults.threshold) {
            return Err(ConfigError::Invalid {
                field: "defaults.threshold",
                reason: format!("{} is outside [0, 1]", self.defaults.threshold),
            });
        }
        Ok(())
    }
}
