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

//! Inbound agent events and the transport seam the driver talks through

use crate::DriverError;
use async_trait::async_trait;
use convoeval_core::Activity;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Stream of inbound events for one exchange
pub type EventStream = BoxStream<'static, Result<AgentEvent, DriverError>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConversationRef {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CardAction {
    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SuggestedActions {
    #[serde(default)]
    pub actions: Vec<CardAction>,
}

/// One activity as the agent sends it on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub text: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub value: Option<serde_json::Value>,

    #[serde(default)]
    pub value_type: Option<String>,

    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub entities: Option<Vec<serde_json::Value>>,

    #[serde(default)]
    pub channel_data: Option<serde_json::Value>,

    #[serde(default)]
    pub conversation: Option<ConversationRef>,

    #[serde(default)]
    pub suggested_actions: Option<SuggestedActions>,
}

impl AgentEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self {
            kind: "message".to_string(),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn with_conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation = Some(ConversationRef {
            id: Some(id.into()),
        });
        self
    }

    pub fn with_suggestions<I, S>(mut self, titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suggested_actions = Some(SuggestedActions {
            actions: titles
                .into_iter()
                .map(|t| CardAction {
                    title: Some(t.into()),
                    value: None,
                })
                .collect(),
        });
        self
    }

    pub fn is_message(&self) -> bool {
        self.kind == "message"
    }

    pub fn is_end_of_conversation(&self) -> bool {
        matches!(self.kind.as_str(), "endOfConversation" | "end_of_conversation")
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation
            .as_ref()?
            .id
            .as_deref()
            .filter(|id| !id.is_empty())
    }

    /// Non-blank message text
    pub fn message_text(&self) -> Option<&str> {
        if !self.is_message() {
            return None;
        }
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }

    pub fn suggestion_titles(&self) -> Vec<&str> {
        self.suggested_actions
            .iter()
            .flat_map(|s| s.actions.iter())
            .filter_map(|a| a.title.as_deref())
            .collect()
    }

    /// Normalize into the activity record kept alongside a conversation
    pub fn to_activity(&self) -> Activity {
        Activity {
            kind: self.kind.clone(),
            text: self.text.clone(),
            name: self.name.clone(),
            value: self.value.clone(),
            value_type: self.value_type.clone(),
            label: self.label.clone(),
            entities: self.entities.clone().unwrap_or_default(),
            channel_data: self.channel_data.clone(),
        }
    }
}

/// Session protocol with a conversational agent.
///
/// `start_session` must eventually yield an event carrying the session
/// identifier; `send` yields the agent's events for one user message.
/// Both streams end when the exchange is over or the connection closes.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn start_session(&self, token: &str) -> Result<EventStream, DriverError>;

    async fn send(&self, token: &str, session_id: &str, text: &str)
        -> Result<EventStream, DriverError>;
}

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// Chunks may split lines (and UTF-8 sequences) anywhere; complete
/// frames come out once their terminating blank line arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush whatever is buffered once the body has ended
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
            if let Some(frame) = self.process_line(&line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: activity\nda").is_empty());
        assert!(decoder.push(b"ta: {\"type\":\"message\"}\r\n").is_empty());
        let frames = decoder.push(b"\r\n: keep-alive\n\nevent: end\ndata: end\n\n");

        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: Some("activity".to_string()),
                    data: r#"{"type":"message"}"#.to_string(),
                },
                SseFrame {
                    event: Some("end".to_string()),
                    data: "end".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_decoder_joins_multiline_data_and_flushes_tail() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: first\ndata: second").is_empty());
        let frame = decoder.finish().unwrap();
        assert_eq!(frame.event, None);
        assert_eq!(frame.data, "first\nsecond");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_event_parsing_from_wire() {
        let raw = r#"{
            "type": "message",
            "text": "Pick one",
            "conversation": {"id": "conv-1"},
            "suggestedActions": {"actions": [{"title": "Yes"}, {"title": "No"}]},
            "channelData": {"streamType": "final"}
        }"#;
        let event: AgentEvent = serde_json::from_str(raw).unwrap();

        assert_eq!(event.conversation_id(), Some("conv-1"));
        assert_eq!(event.message_text(), Some("Pick one"));
        assert_eq!(event.suggestion_titles(), vec!["Yes", "No"]);

        let activity = event.to_activity();
        assert_eq!(activity.kind, "message");
        assert_eq!(activity.channel_data.unwrap()["streamType"], "final");
    }

    #[test]
    fn test_routing_event_survives_normalization() {
        let raw = r#"{
            "type": "event",
            "name": "DynamicPlanStepTriggered",
            "valueType": "DynamicPlanStepTriggered",
            "value": {"taskDialogId": "rrs_bot.topic.Vacation"}
        }"#;
        let event: AgentEvent = serde_json::from_str(raw).unwrap();
        let activity = event.to_activity();

        assert_eq!(activity.routed_topic(), Some("rrs_bot.topic.Vacation"));
        assert_eq!(activity.value_type.as_deref(), Some("DynamicPlanStepTriggered"));
        assert!(event.message_text().is_none());
    }

    #[test]
    fn test_end_of_conversation_spellings() {
        assert!(AgentEvent::new("endOfConversation").is_end_of_conversation());
        assert!(AgentEvent::new("end_of_conversation").is_end_of_conversation());
        assert!(!AgentEvent::new("typing").is_end_of_conversation());
    }
}
