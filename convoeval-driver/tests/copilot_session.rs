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

//! Driver talking to a mock Copilot Studio endpoint over real HTTP

use convoeval_driver::{
    AgentConversationDriver, ConversationDriver, CopilotStudioTransport, StaticTokenProvider,
};
use mockito::Matcher;
use std::sync::Arc;
use std::time::Duration;

const BOT_PATH: &str =
    "/copilotstudio/dataverse-backed/authenticated/bots/cr123_hr/conversations";

fn sse(events: &[&str]) -> String {
    let mut body = String::new();
    for event in events {
        body.push_str("event: activity\ndata: ");
        body.push_str(event);
        body.push_str("\n\n");
    }
    body.push_str("event: end\ndata: end\n\n");
    body
}

#[tokio::test]
async fn test_conversation_over_sse() {
    let mut server = mockito::Server::new_async().await;

    let start = server
        .mock("POST", BOT_PATH)
        .match_query(Matcher::Any)
        .match_header("authorization", "Bearer secret-token")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse(&[
            r#"{"type":"message","text":"Hello, how can I help?","conversation":{"id":"abc"}}"#,
        ]))
        .create_async()
        .await;

    let turn = server
        .mock("POST", format!("{}/abc", BOT_PATH).as_str())
        .match_query(Matcher::Any)
        .match_body(Matcher::PartialJson(serde_json::json!({
            "activity": { "text": "How many vacation days do I have?" }
        })))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse(&[
            r#"{"type":"event","name":"DynamicPlanStepTriggered","value":{"taskDialogId":"cr123_hr.topic.VacationBalance"}}"#,
            r#"{"type":"message","text":"You have 15 vacation days remaining."}"#,
        ]))
        .create_async()
        .await;

    let transport = CopilotStudioTransport::new(server.url(), "cr123_hr", "2022-03-01-preview");
    let driver = AgentConversationDriver::new(
        Arc::new(transport),
        Arc::new(StaticTokenProvider::new("secret-token")),
        Duration::from_secs(5),
    );

    let (conversation, activities) = driver
        .run_conversation(&["How many vacation days do I have?".to_string()])
        .await
        .unwrap();

    start.assert_async().await;
    turn.assert_async().await;

    assert_eq!(conversation.len(), 2);
    assert_eq!(conversation[1].content, "You have 15 vacation days remaining.");
    assert_eq!(activities.len(), 2);
    assert_eq!(
        activities[0].routed_topic(),
        Some("cr123_hr.topic.VacationBalance")
    );
}
