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

//! Drives a multi-turn conversation with an agent over an [`AgentTransport`]

use crate::auth::TokenProvider;
use crate::transport::{AgentTransport, EventStream};
use crate::{ConversationDriver, DriverError};
use async_trait::async_trait;
use convoeval_core::{Activity, Conversation, Message};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const NO_RESPONSE: &str = "[No response from agent]";

/// Everything that arrived for one exchange
#[derive(Debug, Default)]
struct Exchange {
    texts: Vec<String>,
    suggestions: Vec<String>,
    session_id: Option<String>,
    activities: Vec<Activity>,
}

impl Exchange {
    /// Assistant turn assembled from the collected events
    fn reply(&self) -> String {
        if !self.texts.is_empty() {
            self.texts.join("\n")
        } else if !self.suggestions.is_empty() {
            format!("[Suggested: {}]", self.suggestions.join(", "))
        } else {
            NO_RESPONSE.to_string()
        }
    }
}

/// Conversation driver for agents reachable through an [`AgentTransport`].
///
/// One token is acquired per conversation. A turn ends when the agent
/// sends an end-of-conversation event, closes the stream, or stays silent
/// for the idle timeout.
pub struct AgentConversationDriver {
    transport: Arc<dyn AgentTransport>,
    tokens: Arc<dyn TokenProvider>,
    idle_timeout: Duration,
}

impl AgentConversationDriver {
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        tokens: Arc<dyn TokenProvider>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            tokens,
            idle_timeout,
        }
    }

    async fn collect(&self, mut stream: EventStream) -> Result<Exchange, DriverError> {
        let mut exchange = Exchange::default();

        loop {
            let event = match tokio::time::timeout(self.idle_timeout, stream.next()).await {
                Ok(Some(event)) => event?,
                Ok(None) => break,
                Err(_) => {
                    debug!("Agent idle for {:?}, ending turn", self.idle_timeout);
                    break;
                }
            };

            if exchange.session_id.is_none() {
                exchange.session_id = event.conversation_id().map(str::to_string);
            }
            if let Some(text) = event.message_text() {
                exchange.texts.push(text.to_string());
            }
            exchange
                .suggestions
                .extend(event.suggestion_titles().into_iter().map(str::to_string));
            exchange.activities.push(event.to_activity());

            if event.is_end_of_conversation() {
                break;
            }
        }

        Ok(exchange)
    }
}

#[async_trait]
impl ConversationDriver for AgentConversationDriver {
    async fn run_conversation(
        &self,
        turns: &[String],
    ) -> Result<(Conversation, Vec<Activity>), DriverError> {
        let token = self.tokens.acquire_token().await?;

        let greeting = self
            .collect(self.transport.start_session(&token).await?)
            .await?;
        let session_id = greeting.session_id.clone().ok_or(DriverError::NoSession)?;
        debug!(
            "Agent session {} started ({} greeting messages)",
            session_id,
            greeting.texts.len()
        );

        let mut conversation = Vec::with_capacity(turns.len() * 2);
        let mut activities = Vec::new();

        for turn in turns {
            debug!("Sending turn to session {}: {}", session_id, turn);
            conversation.push(Message::user(turn.as_str()));

            let stream = self.transport.send(&token, &session_id, turn).await?;
            let exchange = self.collect(stream).await?;

            conversation.push(Message::assistant(exchange.reply()));
            activities.extend(exchange.activities);
        }

        Ok((conversation, activities))
    }
}
