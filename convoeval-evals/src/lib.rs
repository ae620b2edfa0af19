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

//! # Convoeval Metrics
//!
//! Scoring for conversations produced by an agent under test.
//!
//! ## Features
//!
//! - **One metric contract**: deterministic checks and LLM-judged metrics
//!   both implement [`Metric`] and return a [`MetricResult`]
//! - **Lazy judge**: the judge client is created on first use within an
//!   [`MetricRegistry::evaluate_case`] call and shared by every judged metric
//!   in that call
//! - **Failure isolation**: a failing metric yields a zero score with the
//!   error text; it never fails the case
//! - **Retrospective scoring**: deterministic metrics over exported
//!   transcripts without re-invoking the agent
//!
//! ## Example
//!
//! ```rust,ignore
//! use convoeval_evals::{CaseInput, MetricRegistry};
//!
//! let registry = MetricRegistry::deterministic();
//! let case = CaseInput::new(turns, conversation).with_keywords_any(["days remaining"]);
//! let scores = registry
//!     .evaluate_case(&case, &["keyword_match_any".to_string()], 0.5)
//!     .await;
//! ```

use async_trait::async_trait;
use convoeval_core::{last_assistant, last_user, Activity, Message, TestCase};
use std::sync::Arc;
use thiserror::Error;

pub mod judge;
pub mod llm_client;
pub mod metrics;
pub mod registry;
pub mod retro;

pub use convoeval_core::{MetricResult, ScoreMap};
pub use judge::{ConfigJudgeFactory, JudgeFactory, JudgeMetric, JudgeTestCase, JudgedKind, LazyJudge};
pub use llm_client::{AzureOpenAIClient, LlmClient, LlmError, LlmResponse, OpenAIClient};
pub use registry::MetricRegistry;

/// Core trait that all metrics implement
#[async_trait]
pub trait Metric: Send + Sync {
    /// Registry name (e.g. `"exact_match"`)
    fn name(&self) -> &str;

    /// Metrics that cannot score without reference context
    fn requires_context(&self) -> bool {
        false
    }

    /// Score one case. Errors are turned into failed results by the caller.
    async fn evaluate(&self, ctx: &MetricContext<'_>) -> Result<MetricResult, MetricError>;
}

/// Errors a metric can raise while scoring
#[derive(Debug, Error)]
pub enum MetricError {
    #[error("{0}")]
    Judge(#[from] LlmError),

    #[error("No judge model available")]
    NoJudge,

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Everything a metric may look at for one case
#[derive(Debug, Clone, Default)]
pub struct CaseInput {
    /// User turns that were sent to the agent
    pub turns: Vec<Message>,

    /// Full transcript produced by the agent
    pub conversation: Vec<Message>,

    pub expected_output: String,

    pub context: String,

    pub activities: Vec<Activity>,

    pub expected_topic: String,

    pub keywords_any: Vec<String>,

    pub keywords_all: Vec<String>,
}

impl CaseInput {
    pub fn new(turns: Vec<Message>, conversation: Vec<Message>) -> Self {
        Self {
            turns,
            conversation,
            ..Self::default()
        }
    }

    /// Combine a dataset case with the conversation it produced
    pub fn from_case(case: &TestCase, conversation: Vec<Message>, activities: Vec<Activity>) -> Self {
        Self {
            turns: case.user_utterances().into_iter().map(Message::user).collect(),
            conversation,
            expected_output: case.expected_output.clone().unwrap_or_default(),
            context: case.context.clone().unwrap_or_default(),
            activities,
            expected_topic: case.expected_topic.clone().unwrap_or_default(),
            keywords_any: case.keywords_any.clone(),
            keywords_all: case.keywords_all.clone(),
        }
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = expected.into();
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_activities(mut self, activities: Vec<Activity>) -> Self {
        self.activities = activities;
        self
    }

    pub fn with_expected_topic(mut self, topic: impl Into<String>) -> Self {
        self.expected_topic = topic.into();
        self
    }

    pub fn with_keywords_any<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords_any = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_keywords_all<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords_all = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Last assistant message, or empty if the agent never answered
    pub fn actual_output(&self) -> &str {
        last_assistant(&self.conversation).unwrap_or("")
    }

    /// Last user input sent to the agent
    pub fn user_input(&self) -> &str {
        last_user(&self.turns)
            .or_else(|| last_user(&self.conversation))
            .unwrap_or("")
    }
}

/// Per-call view handed to each metric
pub struct MetricContext<'a> {
    pub case: &'a CaseInput,
    pub threshold: f64,
    judge: &'a LazyJudge,
}

impl<'a> MetricContext<'a> {
    pub fn new(case: &'a CaseInput, threshold: f64, judge: &'a LazyJudge) -> Self {
        Self {
            case,
            threshold,
            judge,
        }
    }

    /// Judge client for this call, created on first use
    pub async fn judge(&self) -> Result<Arc<dyn LlmClient>, MetricError> {
        self.judge.get().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoeval_core::EvalType;

    #[test]
    fn test_case_input_from_autonomous_case() {
        let case = TestCase::autonomous("Book two days off next week")
            .with_expected_topic("TimeOff");
        assert!(case.validate(EvalType::Autonomous).is_ok());

        let input = CaseInput::from_case(
            &case,
            vec![
                Message::user("Book two days off next week"),
                Message::assistant("Done."),
            ],
            Vec::new(),
        );
        assert_eq!(input.turns, vec![Message::user("Book two days off next week")]);
        assert_eq!(input.user_input(), "Book two days off next week");
        assert_eq!(input.actual_output(), "Done.");
        assert_eq!(input.expected_topic, "TimeOff");
    }

    #[test]
    fn test_actual_output_without_reply() {
        let input = CaseInput::new(vec![Message::user("hi")], vec![Message::user("hi")]);
        assert_eq!(input.actual_output(), "");
    }
}
