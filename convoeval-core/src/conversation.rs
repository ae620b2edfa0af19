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

//! Conversation transcripts and captured agent activities

use serde::{Deserialize, Serialize};

/// Activity name emitted when the agent's planner routes to a topic
pub const DYNAMIC_PLAN_STEP_TRIGGERED: &str = "DynamicPlanStepTriggered";

/// Speaker of a conversation message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Ordered transcript of a conversation with the agent.
///
/// Role alternation is not enforced: one assistant message may be
/// assembled from several inbound protocol events.
pub type Conversation = Vec<Message>;

/// Content of the last assistant message, if any
pub fn last_assistant(conversation: &[Message]) -> Option<&str> {
    conversation
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .map(|m| m.content.as_str())
}

/// Content of the last user message, if any
pub fn last_user(conversation: &[Message]) -> Option<&str> {
    conversation
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
}

/// A raw side-channel event captured while talking to the agent.
///
/// Activities are kept verbatim for diagnostics; only the topic routing
/// metric looks inside them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Activity {
    /// Primary discriminant (`message`, `invoke`, `trace`, `event`, ...)
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub text: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<serde_json::Value>,
}

impl Activity {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// Synthesize a routing event for `topic`
    pub fn routing(topic: impl Into<String>) -> Self {
        Self {
            kind: "event".to_string(),
            name: Some(DYNAMIC_PLAN_STEP_TRIGGERED.to_string()),
            value: Some(serde_json::json!({ "taskDialogId": topic.into() })),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Topic identifier this activity routed to, if it is a routing event
    pub fn routed_topic(&self) -> Option<&str> {
        if self.name.as_deref() != Some(DYNAMIC_PLAN_STEP_TRIGGERED) {
            return None;
        }
        self.value
            .as_ref()?
            .get("taskDialogId")?
            .as_str()
            .filter(|id| !id.is_empty())
    }
}
