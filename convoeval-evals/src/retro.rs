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

//! Retrospective evaluation of recorded conversation transcripts
//!
//! Transcripts exported from the agent platform are scored with the
//! deterministic metrics without re-invoking the agent, and mined for
//! utterances worth adding to a dataset.

use crate::metrics::{exact_match, keyword_match, topic_routing, KeywordMode};
use convoeval_core::{Activity, Message, Role, ScoreMap, TestCase};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.5;

/// One exported transcript row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptRecord {
    #[serde(rename = "conversationtranscriptid", default)]
    pub transcript_id: String,

    /// JSON array of activities, as a string
    #[serde(default)]
    pub content: String,

    #[serde(rename = "createdon", default)]
    pub created_on: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentRecognition {
    pub topic: String,
    pub score: f64,
}

/// Side-channel facts recovered from a transcript
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedTranscript {
    pub intent_recognition: Vec<IntentRecognition>,
    /// Resolved / Escalated / Abandoned, or empty when unknown
    pub session_outcome: String,
    pub dialog_redirects: Vec<String>,
    pub csat: Option<f64>,
}

fn parse_activities(content: &str) -> Vec<Value> {
    if content.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Array(items)) => items,
        Ok(_) => Vec::new(),
        Err(e) => {
            tracing::warn!("Failed to parse transcript content: {}", e);
            Vec::new()
        }
    }
}

fn lenient_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn first_str<'a>(value: &'a Value, keys: &[&str]) -> &'a str {
    keys.iter()
        .find_map(|k| value.get(*k))
        .and_then(Value::as_str)
        .unwrap_or("")
}

/// Message turns of a transcript, in order. Blank messages are dropped.
pub fn extract_conversation(content: &str) -> Vec<Message> {
    parse_activities(content)
        .iter()
        .filter(|a| a.get("type").and_then(Value::as_str) == Some("message"))
        .filter_map(|a| {
            let text = a.get("text").and_then(Value::as_str)?.trim();
            if text.is_empty() {
                return None;
            }

            let from = a.get("from");
            let raw_role = from
                .and_then(|f| f.get("role"))
                .and_then(Value::as_str)
                .unwrap_or("");
            let role = match raw_role {
                "user" => Role::User,
                "bot" | "skill" => Role::Assistant,
                _ => {
                    let from_id = from
                        .and_then(|f| f.get("id"))
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_lowercase();
                    if from_id.is_empty() || from_id.contains("user") {
                        Role::User
                    } else {
                        Role::Assistant
                    }
                }
            };

            Some(Message {
                role,
                content: text.to_string(),
            })
        })
        .collect()
}

/// Intent recognition, session outcome, redirects and CSAT of a transcript
pub fn parse_transcript(content: &str) -> ParsedTranscript {
    let mut parsed = ParsedTranscript::default();

    for activity in parse_activities(content) {
        let value_type = activity.get("valueType").and_then(Value::as_str).unwrap_or("");
        let value = activity.get("value").cloned().unwrap_or(Value::Null);

        match value_type {
            "IntentRecognition" => {
                let topic = first_str(&value, &["topicName", "intent"]);
                let score = ["confidence", "score"]
                    .iter()
                    .find_map(|k| value.get(*k))
                    .and_then(lenient_f64)
                    .unwrap_or(0.0);
                if !topic.is_empty() {
                    parsed.intent_recognition.push(IntentRecognition {
                        topic: topic.to_string(),
                        score,
                    });
                }
            }
            "SessionInfo" => {
                parsed.session_outcome = first_str(&value, &["outcome", "sessionOutcome"]).to_string();
            }
            "DialogRedirect" => {
                let target = first_str(&value, &["targetDialogId", "dialogId"]);
                if !target.is_empty() {
                    parsed.dialog_redirects.push(target.to_string());
                }
            }
            "CSATSurveyResponse" => {
                if let Some(rating) = ["rating", "csatScore"]
                    .iter()
                    .find_map(|k| value.get(*k))
                    .and_then(lenient_f64)
                {
                    parsed.csat = Some(rating);
                }
            }
            _ => {}
        }
    }

    parsed
}

/// A historical conversation reconstructed from its transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetroCase {
    pub transcript_id: String,
    pub conversation: Vec<Message>,
    /// User messages only
    pub turns: Vec<Message>,
    pub intent_recognition: Vec<IntentRecognition>,
    pub session_outcome: String,
    pub dialog_redirects: Vec<String>,
    pub csat: Option<f64>,
    pub created_at: Option<String>,
}

impl RetroCase {
    /// `None` when the transcript has no user message
    pub fn from_record(record: &TranscriptRecord) -> Option<Self> {
        let conversation = extract_conversation(&record.content);
        let turns: Vec<Message> = conversation
            .iter()
            .filter(|m| m.role == Role::User)
            .cloned()
            .collect();
        if turns.is_empty() {
            tracing::debug!("Transcript {}: no user messages", record.transcript_id);
            return None;
        }

        let parsed = parse_transcript(&record.content);
        Some(Self {
            transcript_id: record.transcript_id.clone(),
            conversation,
            turns,
            intent_recognition: parsed.intent_recognition,
            session_outcome: parsed.session_outcome,
            dialog_redirects: parsed.dialog_redirects,
            csat: parsed.csat,
            created_at: record.created_on.clone(),
        })
    }

    fn actual_output(&self) -> &str {
        convoeval_core::last_assistant(&self.conversation).unwrap_or("")
    }
}

/// Optional expectations applied to every transcript
#[derive(Debug, Clone, Default)]
pub struct RetroExpectations {
    pub expected_topic: String,
    pub expected_output: String,
    pub keywords_any: Vec<String>,
    pub keywords_all: Vec<String>,
}

/// Run the deterministic metrics that apply to `case`.
///
/// Topic routing runs when an expected topic is given or intents were
/// recognized; the text metrics run only when configured.
pub fn run_deterministic_metrics(case: &RetroCase, expect: &RetroExpectations) -> ScoreMap {
    let mut results = ScoreMap::new();
    let actual = case.actual_output();

    let activities: Vec<Activity> = case
        .intent_recognition
        .iter()
        .filter(|i| !i.topic.is_empty())
        .map(|i| Activity::routing(i.topic.clone()))
        .collect();
    if !activities.is_empty() || !expect.expected_topic.is_empty() {
        results.insert(
            "topic_routing".to_string(),
            topic_routing(&activities, &expect.expected_topic),
        );
    }

    if !expect.expected_output.is_empty() {
        results.insert(
            "exact_match".to_string(),
            exact_match(actual, &expect.expected_output),
        );
    }
    if !expect.keywords_any.is_empty() {
        results.insert(
            "keyword_match_any".to_string(),
            keyword_match(actual, &expect.keywords_any, KeywordMode::Any),
        );
    }
    if !expect.keywords_all.is_empty() {
        results.insert(
            "keyword_match_all".to_string(),
            keyword_match(actual, &expect.keywords_all, KeywordMode::All),
        );
    }

    results
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetroEvalResult {
    pub transcript_id: String,
    pub metric_results: ScoreMap,
    pub session_outcome: String,
    pub csat: Option<f64>,
    pub conversation_length: usize,
}

/// Score every usable transcript; transcripts without user messages are skipped
pub fn evaluate_transcripts(
    records: &[TranscriptRecord],
    expect: &RetroExpectations,
) -> Vec<RetroEvalResult> {
    let mut results = Vec::new();
    let mut skipped = 0;

    for record in records {
        let Some(case) = RetroCase::from_record(record) else {
            skipped += 1;
            continue;
        };
        results.push(RetroEvalResult {
            transcript_id: case.transcript_id.clone(),
            metric_results: run_deterministic_metrics(&case, expect),
            session_outcome: case.session_outcome.clone(),
            csat: case.csat,
            conversation_length: case.conversation.len(),
        });
    }

    tracing::info!(
        evaluated = results.len(),
        skipped,
        "Retro evaluation complete"
    );
    results
}

/// Aggregate view over retro results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetroSummary {
    pub total: usize,
    /// Session outcome to count; unknown outcomes are counted as `"Unknown"`
    pub outcomes: BTreeMap<String, usize>,
    /// Metric name to `(passed, total)`
    pub metric_passes: BTreeMap<String, (usize, usize)>,
    pub avg_csat: Option<f64>,
    pub csat_count: usize,
}

pub fn summarize(results: &[RetroEvalResult]) -> RetroSummary {
    let mut summary = RetroSummary {
        total: results.len(),
        ..RetroSummary::default()
    };

    for result in results {
        let outcome = if result.session_outcome.is_empty() {
            "Unknown"
        } else {
            result.session_outcome.as_str()
        };
        *summary.outcomes.entry(outcome.to_string()).or_default() += 1;

        for (name, metric) in &result.metric_results {
            let entry = summary.metric_passes.entry(name.clone()).or_default();
            entry.1 += 1;
            if metric.passed {
                entry.0 += 1;
            }
        }
    }

    let csat: Vec<f64> = results.iter().filter_map(|r| r.csat).collect();
    summary.csat_count = csat.len();
    if !csat.is_empty() {
        summary.avg_csat = Some(csat.iter().sum::<f64>() / csat.len() as f64);
    }
    summary
}

/// A candidate test case mined from a transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSuggestion {
    pub utterance: String,
    pub follow_up_turns: Vec<String>,
    pub inferred_topic: String,
    pub session_outcome: String,
    pub source_transcript_id: String,
    pub is_multi_turn: bool,
}

impl DatasetSuggestion {
    /// Turn the suggestion into a dataset case
    pub fn to_test_case(&self) -> TestCase {
        let mut case = if self.is_multi_turn {
            TestCase::multi_turn(
                std::iter::once(self.utterance.clone()).chain(self.follow_up_turns.iter().cloned()),
            )
        } else {
            TestCase::single_turn(self.utterance.clone())
        };
        if !self.inferred_topic.is_empty() {
            case = case.with_expected_topic(self.inferred_topic.clone());
        }
        case.tags = vec!["retro".to_string()];
        case
    }
}

/// Suggest new dataset cases from first utterances not seen before.
///
/// `existing` holds normalized (trimmed, lowercased) utterances already in
/// datasets. The inferred topic is the highest-confidence intent at or above
/// `min_confidence`.
pub fn suggest_dataset_cases(
    cases: &[RetroCase],
    existing: &HashSet<String>,
    min_confidence: f64,
) -> Vec<DatasetSuggestion> {
    let mut seen = existing.clone();
    let mut suggestions = Vec::new();

    for case in cases {
        let Some(first) = case.turns.first() else {
            continue;
        };
        let normalized = normalize_utterance(&first.content);
        if seen.contains(&normalized) {
            continue;
        }

        let mut best: Option<&IntentRecognition> = None;
        for intent in &case.intent_recognition {
            if best.map_or(true, |b| intent.score > b.score) {
                best = Some(intent);
            }
        }
        let inferred_topic = best
            .filter(|b| b.score >= min_confidence)
            .map(|b| b.topic.clone())
            .unwrap_or_default();

        suggestions.push(DatasetSuggestion {
            utterance: first.content.clone(),
            follow_up_turns: case.turns[1..].iter().map(|t| t.content.clone()).collect(),
            inferred_topic,
            session_outcome: case.session_outcome.clone(),
            source_transcript_id: case.transcript_id.clone(),
            is_multi_turn: case.turns.len() > 1,
        });
        seen.insert(normalized);
    }

    tracing::info!(
        "Generated {} dataset suggestion(s) from {} transcript(s)",
        suggestions.len(),
        cases.len()
    );
    suggestions
}

pub fn normalize_utterance(utterance: &str) -> String {
    utterance.trim().to_lowercase()
}
