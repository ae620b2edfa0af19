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

//! Conversation driving for convoeval
//!
//! Turns a list of user utterances into a finished transcript plus the raw
//! activity log, by talking to a conversational agent:
//!
//! - [`auth`]: bearer token providers
//! - [`transport`]: the [`AgentTransport`] seam and wire event model
//! - [`copilot`]: Copilot Studio transport over server-sent events
//! - [`driver`]: the [`AgentConversationDriver`]

pub mod auth;
pub mod copilot;
pub mod driver;
pub mod transport;

use async_trait::async_trait;
use convoeval_core::{last_assistant, Activity, Conversation, EngineConfig};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use auth::{
    provider_from_config, AuthError, ClientCredentialsTokenProvider, StaticTokenProvider,
    TokenProvider,
};
pub use copilot::{environment_base_url, CopilotStudioTransport};
pub use driver::{AgentConversationDriver, NO_RESPONSE};
pub use transport::{AgentEvent, AgentTransport, EventStream, SseDecoder, SseFrame};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Failed to start conversation: no conversation ID received")]
    NoSession,

    #[error("Agent returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed agent event: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Agent not configured: {0}")]
    NotConfigured(String),
}

/// Runs user turns against an agent and returns what came back.
#[async_trait]
pub trait ConversationDriver: Send + Sync {
    /// Send `turns` in order within one session.
    ///
    /// The transcript alternates one user message and one assistant
    /// message per turn; activities hold every event received during the
    /// turns.
    async fn run_conversation(
        &self,
        turns: &[String],
    ) -> Result<(Conversation, Vec<Activity>), DriverError>;

    /// Single-message smoke test
    async fn ping(&self, message: &str) -> Result<String, DriverError> {
        let (conversation, _) = self.run_conversation(&[message.to_string()]).await?;
        Ok(last_assistant(&conversation)
            .unwrap_or(NO_RESPONSE)
            .to_string())
    }
}

/// Build the Copilot Studio driver described by `config`
pub fn driver_from_config(
    config: &EngineConfig,
) -> Result<Arc<dyn ConversationDriver>, DriverError> {
    let transport = CopilotStudioTransport::from_config(&config.agent)?;
    let tokens = provider_from_config(&config.auth)?;
    let idle_timeout = Duration::from_secs(config.agent.idle_timeout_secs.max(1));

    Ok(Arc::new(AgentConversationDriver::new(
        Arc::new(transport),
        tokens,
        idle_timeout,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_from_config() {
        let mut config = EngineConfig::default();
        assert!(matches!(
            driver_from_config(&config),
            Err(DriverError::NotConfigured(_))
        ));

        config.agent.environment_id = Some("Default-1234abcd".to_string());
        config.agent.agent_identifier = Some("cr123_agent".to_string());
        assert!(matches!(
            driver_from_config(&config),
            Err(DriverError::Auth(AuthError::MissingCredential(_)))
        ));

        config.auth.token = Some("tok".to_string());
        assert!(driver_from_config(&config).is_ok());
    }
}
