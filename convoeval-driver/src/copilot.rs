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

//! Copilot Studio direct-to-engine transport over server-sent events

use crate::transport::{AgentEvent, AgentTransport, EventStream, SseDecoder, SseFrame};
use crate::DriverError;
use async_stream::try_stream;
use async_trait::async_trait;
use convoeval_core::AgentConfig;
use futures::{Stream, StreamExt};
use serde_json::json;
use tracing::{debug, warn};

const ENVIRONMENT_HOST_SUFFIX: &str = "environment.api.powerplatform.com";
const ENVIRONMENT_ID_SUFFIX_LEN: usize = 2;
const MAX_ERROR_BODY: usize = 500;

/// Host for a Power Platform environment id.
///
/// The id is lowercased with dashes removed, and its last two characters
/// become a separate DNS label.
pub fn environment_base_url(environment_id: &str) -> Result<String, DriverError> {
    let normalized: String = environment_id
        .trim()
        .chars()
        .filter(|c| *c != '-')
        .flat_map(|c| c.to_lowercase())
        .collect();

    if normalized.len() <= ENVIRONMENT_ID_SUFFIX_LEN
        || !normalized.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(DriverError::NotConfigured(format!(
            "invalid environment id '{}'",
            environment_id
        )));
    }

    let (prefix, suffix) = normalized.split_at(normalized.len() - ENVIRONMENT_ID_SUFFIX_LEN);
    Ok(format!(
        "https://{}.{}.{}",
        prefix, suffix, ENVIRONMENT_HOST_SUFFIX
    ))
}

pub struct CopilotStudioTransport {
    client: reqwest::Client,
    base_url: String,
    agent_identifier: String,
    api_version: String,
}

impl CopilotStudioTransport {
    pub fn new(
        base_url: impl Into<String>,
        agent_identifier: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent_identifier: agent_identifier.into(),
            api_version: api_version.into(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, DriverError> {
        let agent_identifier = config
            .agent_identifier
            .clone()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| DriverError::NotConfigured("agent_identifier".to_string()))?;

        let base_url = match (&config.base_url, &config.environment_id) {
            (Some(url), _) if !url.is_empty() => url.clone(),
            (_, Some(env)) => environment_base_url(env)?,
            _ => {
                return Err(DriverError::NotConfigured(
                    "environment_id or base_url".to_string(),
                ))
            }
        };

        Ok(Self::new(base_url, agent_identifier, config.api_version.clone()))
    }

    fn conversations_url(&self, session_id: Option<&str>) -> String {
        let mut url = format!(
            "{}/copilotstudio/dataverse-backed/authenticated/bots/{}/conversations",
            self.base_url, self.agent_identifier
        );
        if let Some(id) = session_id {
            url.push('/');
            url.push_str(id);
        }
        url.push_str("?api-version=");
        url.push_str(&self.api_version);
        url
    }

    async fn post(
        &self,
        url: String,
        token: &str,
        body: serde_json::Value,
    ) -> Result<EventStream, DriverError> {
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY).collect(),
            });
        }

        Ok(event_stream(response))
    }
}

fn decode_frame(frame: SseFrame) -> Result<Option<AgentEvent>, DriverError> {
    match frame.event.as_deref() {
        Some("end") => Ok(None),
        _ => {
            let event: AgentEvent = serde_json::from_str(&frame.data)?;
            Ok(Some(event))
        }
    }
}

fn event_stream(response: reqwest::Response) -> EventStream {
    Box::pin(sse_events(response))
}

fn sse_events(
    response: reqwest::Response,
) -> impl Stream<Item = Result<AgentEvent, DriverError>> + Send + 'static {
    try_stream! {
        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut ended = false;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(DriverError::from)?;
            for frame in decoder.push(&chunk) {
                match decode_frame(frame)? {
                    Some(event) => {
                        yield event;
                    }
                    None => ended = true,
                }
            }
            if ended {
                break;
            }
        }

        if !ended {
            if let Some(frame) = decoder.finish() {
                if let Some(event) = decode_frame(frame)? {
                    yield event;
                }
            }
        }
    }
}

#[async_trait]
impl AgentTransport for CopilotStudioTransport {
    async fn start_session(&self, token: &str) -> Result<EventStream, DriverError> {
        let url = self.conversations_url(None);
        debug!("Starting agent conversation at {}", url);
        self.post(url, token, json!({ "emitStartConversationEvent": true }))
            .await
    }

    async fn send(
        &self,
        token: &str,
        session_id: &str,
        text: &str,
    ) -> Result<EventStream, DriverError> {
        if session_id.is_empty() {
            warn!("Sending to agent without a session id");
        }
        let url = self.conversations_url(Some(session_id));
        debug!("Sending message to conversation {}", session_id);
        self.post(
            url,
            token,
            json!({
                "activity": {
                    "type": "message",
                    "text": text,
                    "conversation": { "id": session_id },
                }
            }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use mockito::Matcher;

    const BOT_PATH: &str = "/copilotstudio/dataverse-backed/authenticated/bots/cr123_agent/conversations";

    fn transport(server: &mockito::Server) -> CopilotStudioTransport {
        CopilotStudioTransport::new(server.url(), "cr123_agent", "2022-03-01-preview")
    }

    #[test]
    fn test_environment_base_url() {
        assert_eq!(
            environment_base_url("Default-1234-ABCD").unwrap(),
            "https://default1234ab.cd.environment.api.powerplatform.com"
        );
        assert!(environment_base_url("a").is_err());
        assert!(environment_base_url("bad/host").is_err());
    }

    #[test]
    fn test_from_config_requires_agent_and_host() {
        let mut config = AgentConfig::default();
        assert!(CopilotStudioTransport::from_config(&config).is_err());

        config.agent_identifier = Some("cr123_agent".to_string());
        assert!(CopilotStudioTransport::from_config(&config).is_err());

        config.base_url = Some("http://localhost:9000/".to_string());
        let transport = CopilotStudioTransport::from_config(&config).unwrap();
        assert_eq!(
            transport.conversations_url(Some("c1")),
            format!(
                "http://localhost:9000{}/c1?api-version=2022-03-01-preview",
                BOT_PATH
            )
        );
    }

    #[tokio::test]
    async fn test_start_session_streams_events() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "event: activity\n",
            "data: {\"type\":\"typing\",\"conversation\":{\"id\":\"conv-9\"}}\n\n",
            "event: activity\n",
            "data: {\"type\":\"message\",\"text\":\"Hello!\",\"conversation\":{\"id\":\"conv-9\"}}\n\n",
            "event: end\n",
            "data: end\n\n",
        );
        let mock = server
            .mock("POST", BOT_PATH)
            .match_query(Matcher::UrlEncoded(
                "api-version".into(),
                "2022-03-01-preview".into(),
            ))
            .match_header("authorization", "Bearer tok")
            .match_body(Matcher::Json(json!({ "emitStartConversationEvent": true })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let events: Vec<AgentEvent> = transport(&server)
            .start_session("tok")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].conversation_id(), Some("conv-9"));
        assert_eq!(events[1].message_text(), Some("Hello!"));
    }

    #[tokio::test]
    async fn test_send_posts_message_activity() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", format!("{}/conv-9", BOT_PATH).as_str())
            .match_query(Matcher::Any)
            .match_body(Matcher::PartialJson(json!({
                "activity": { "type": "message", "text": "How many vacation days?" }
            })))
            .with_status(200)
            .with_body("data: {\"type\":\"message\",\"text\":\"15\"}\n\n")
            .create_async()
            .await;

        let events: Vec<AgentEvent> = transport(&server)
            .send("tok", "conv-9", "How many vacation days?")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message_text(), Some("15"));
    }

    #[tokio::test]
    async fn test_error_status_surfaces_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", BOT_PATH)
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body("forbidden: agent not published")
            .create_async()
            .await;

        match transport(&server).start_session("tok").await {
            Err(DriverError::Status { status, body }) => {
                assert_eq!(status, 403);
                assert!(body.contains("not published"));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected an error status"),
        }
    }

    #[tokio::test]
    async fn test_malformed_event_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", BOT_PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("data: not json\n\n")
            .create_async()
            .await;

        let stream = transport(&server).start_session("tok").await.unwrap();
        let collected: Result<Vec<AgentEvent>, DriverError> = stream.try_collect().await;
        assert!(matches!(collected, Err(DriverError::Json(_))));
    }
}
