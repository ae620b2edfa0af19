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

use crate::conversation::{Message, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while building or editing a dataset
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Dataset name is required")]
    EmptyName,

    #[error("Test case {index} is invalid for a {eval_type} dataset: {reason}")]
    InvalidCase {
        index: usize,
        eval_type: EvalType,
        reason: String,
    },

    #[error("Test case index {index} out of range (dataset has {len} cases)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Import must contain at least one test case")]
    EmptyImport,

    #[error("Unknown evaluation type: {0}")]
    UnknownEvalType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Evaluation type of a dataset; constrains the shape of its cases
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvalType {
    #[default]
    SingleTurn,
    MultiTurn,
    Autonomous,
}

impl EvalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvalType::SingleTurn => "single_turn",
            EvalType::MultiTurn => "multi_turn",
            EvalType::Autonomous => "autonomous",
        }
    }
}

impl fmt::Display for EvalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvalType {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single_turn" => Ok(EvalType::SingleTurn),
            "multi_turn" => Ok(EvalType::MultiTurn),
            "autonomous" => Ok(EvalType::Autonomous),
            other => Err(DatasetError::UnknownEvalType(other.to_string())),
        }
    }
}

/// A single evaluation unit within a dataset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TestCase {
    /// User turns to replay (single-turn and multi-turn datasets)
    #[serde(
        default,
        deserialize_with = "deserialize_turns",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub turns: Vec<Message>,

    /// Goal for autonomous-mode cases
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,

    /// Reference answer for exact-match and judged comparison
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,

    /// Topic the agent is expected to route to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_topic: Option<String>,

    /// Reference text for context-dependent metrics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords_any: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords_all: Vec<String>,

    #[serde(
        default,
        deserialize_with = "deserialize_tags",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
}

impl TestCase {
    /// Create a single-turn test case
    pub fn single_turn(utterance: impl Into<String>) -> Self {
        Self {
            turns: vec![Message::user(utterance)],
            ..Default::default()
        }
    }

    /// Create a multi-turn test case from user utterances
    pub fn multi_turn<I, S>(utterances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            turns: utterances.into_iter().map(Message::user).collect(),
            ..Default::default()
        }
    }

    /// Create an autonomous-mode test case
    pub fn autonomous(goal: impl Into<String>) -> Self {
        Self {
            goal: Some(goal.into()),
            ..Default::default()
        }
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = Some(expected.into());
        self
    }

    pub fn with_expected_topic(mut self, topic: impl Into<String>) -> Self {
        self.expected_topic = Some(topic.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
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

    /// The utterances sent to the agent for this case.
    ///
    /// Autonomous cases open the conversation with their goal.
    pub fn user_utterances(&self) -> Vec<String> {
        if let Some(goal) = self.goal.as_deref().filter(|g| !g.trim().is_empty()) {
            return vec![goal.to_string()];
        }
        self.turns
            .iter()
            .filter(|t| t.role == Role::User)
            .map(|t| t.content.clone())
            .collect()
    }

    /// Check the case shape against the dataset's evaluation type
    pub fn validate(&self, eval_type: EvalType) -> Result<(), String> {
        let has_goal = self.goal.as_deref().is_some_and(|g| !g.trim().is_empty());
        let user_turns = self.turns.iter().filter(|t| t.role == Role::User).count();

        match eval_type {
            EvalType::Autonomous => {
                if !has_goal {
                    return Err("autonomous cases require a goal".to_string());
                }
                if !self.turns.is_empty() {
                    return Err("autonomous cases must not define turns".to_string());
                }
            }
            EvalType::SingleTurn | EvalType::MultiTurn => {
                if has_goal {
                    return Err("goal is only valid for autonomous cases".to_string());
                }
                if user_turns == 0 {
                    return Err("at least one user turn is required".to_string());
                }
                if eval_type == EvalType::SingleTurn && user_turns != 1 {
                    return Err(format!(
                        "single-turn cases take exactly one user turn, got {}",
                        user_turns
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TurnRepr {
    Text(String),
    Message(Message),
}

fn deserialize_turns<'de, D>(deserializer: D) -> Result<Vec<Message>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<TurnRepr>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|t| match t {
            TurnRepr::Text(text) => Message::user(text),
            TurnRepr::Message(message) => message,
        })
        .collect())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TagsRepr {
    List(Vec<String>),
    Csv(String),
}

fn deserialize_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<TagsRepr> = Option::deserialize(deserializer)?;
    Ok(match raw {
        None => Vec::new(),
        Some(TagsRepr::List(tags)) => tags,
        Some(TagsRepr::Csv(tags)) => tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect(),
    })
}

/// A named, ordered collection of test cases
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dataset {
    /// Identifier assigned by the store (0 until persisted)
    pub id: u64,

    pub name: String,

    #[serde(default)]
    pub description: String,

    pub eval_type: EvalType,

    /// Cases in run order; `EvalResult::test_case_index` refers to this ordering
    pub cases: Vec<TestCase>,

    /// Cached number of cases
    pub num_cases: usize,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Dataset {
    /// Create an empty dataset
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        eval_type: EvalType,
    ) -> Result<Self, DatasetError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DatasetError::EmptyName);
        }
        let now = Utc::now();
        Ok(Self {
            id: 0,
            name: name.trim().to_string(),
            description: description.into(),
            eval_type,
            cases: Vec::new(),
            num_cases: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Create a dataset pre-populated with cases
    pub fn with_cases(
        name: impl Into<String>,
        description: impl Into<String>,
        eval_type: EvalType,
        cases: Vec<TestCase>,
    ) -> Result<Self, DatasetError> {
        let mut dataset = Self::new(name, description, eval_type)?;
        if !cases.is_empty() {
            dataset.append_cases(cases)?;
        }
        Ok(dataset)
    }

    /// Get the number of test cases
    pub fn test_case_count(&self) -> usize {
        self.cases.len()
    }

    /// Append a single case
    pub fn add_case(&mut self, case: TestCase) -> Result<(), DatasetError> {
        self.check_case(self.cases.len(), &case)?;
        self.cases.push(case);
        self.touch();
        Ok(())
    }

    /// Append many cases at once; nothing is added if any case is invalid
    pub fn append_cases(&mut self, cases: Vec<TestCase>) -> Result<(), DatasetError> {
        if cases.is_empty() {
            return Err(DatasetError::EmptyImport);
        }
        let offset = self.cases.len();
        for (i, case) in cases.iter().enumerate() {
            self.check_case(offset + i, case)?;
        }
        self.cases.extend(cases);
        self.touch();
        Ok(())
    }

    /// Replace the case at `index`
    pub fn update_case(&mut self, index: usize, case: TestCase) -> Result<(), DatasetError> {
        let len = self.cases.len();
        if index >= len {
            return Err(DatasetError::IndexOutOfRange { index, len });
        }
        self.check_case(index, &case)?;
        self.cases[index] = case;
        self.touch();
        Ok(())
    }

    /// Remove and return the case at `index`
    pub fn remove_case(&mut self, index: usize) -> Result<TestCase, DatasetError> {
        let len = self.cases.len();
        if index >= len {
            return Err(DatasetError::IndexOutOfRange { index, len });
        }
        let removed = self.cases.remove(index);
        self.touch();
        Ok(removed)
    }

    /// Update name and description
    pub fn set_metadata(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<(), DatasetError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DatasetError::EmptyName);
        }
        self.name = name.trim().to_string();
        self.description = description.into();
        self.touch();
        Ok(())
    }

    fn check_case(&self, index: usize, case: &TestCase) -> Result<(), DatasetError> {
        case.validate(self.eval_type)
            .map_err(|reason| DatasetError::InvalidCase {
                index,
                eval_type: self.eval_type,
                reason,
            })
    }

    fn touch(&mut self) {
        self.num_cases = self.cases.len();
        self.updated_at = Utc::now();
    }
}

/// Parse a JSON array of test cases, as accepted by bulk import
pub fn parse_cases_json(content: &str) -> Result<Vec<TestCase>, DatasetError> {
    let cases: Vec<TestCase> = serde_json::from_str(content)?;
    if cases.is_empty() {
        return Err(DatasetError::EmptyImport);
    }
    Ok(cases)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_dataset() {
        let dataset = Dataset::new("HR bot", "Leave questions", EvalType::SingleTurn).unwrap();
        assert_eq!(dataset.name, "HR bot");
        assert_eq!(dataset.num_cases, 0);
        assert!(matches!(
            Dataset::new("  ", "", EvalType::SingleTurn),
            Err(DatasetError::EmptyName)
        ));
    }

    #[test]
    fn test_add_case_refreshes_count() {
        let mut dataset = Dataset::new("HR bot", "", EvalType::SingleTurn).unwrap();
        dataset
            .add_case(TestCase::single_turn("How many vacation days do I have?"))
            .unwrap();
        dataset
            .add_case(TestCase::single_turn("Who is my manager?"))
            .unwrap();
        assert_eq!(dataset.num_cases, 2);

        dataset.remove_case(0).unwrap();
        assert_eq!(dataset.num_cases, 1);
        assert_eq!(dataset.cases[0].turns[0].content, "Who is my manager?");
    }

    #[test]
    fn test_case_shape_enforced_by_eval_type() {
        let mut single = Dataset::new("single", "", EvalType::SingleTurn).unwrap();
        let err = single
            .add_case(TestCase::multi_turn(["hi", "and then?"]))
            .unwrap_err();
        assert!(matches!(err, DatasetError::InvalidCase { index: 0, .. }));
        assert!(single.add_case(TestCase::autonomous("book a flight")).is_err());

        let mut autonomous = Dataset::new("auto", "", EvalType::Autonomous).unwrap();
        assert!(autonomous.add_case(TestCase::autonomous("book a flight")).is_ok());
        assert!(autonomous.add_case(TestCase::single_turn("hi")).is_err());

        let mut multi = Dataset::new("multi", "", EvalType::MultiTurn).unwrap();
        assert!(multi.add_case(TestCase::multi_turn(["hi", "more"])).is_ok());
        assert!(multi.add_case(TestCase::default()).is_err());
    }

    #[test]
    fn test_append_cases_is_all_or_nothing() {
        let mut dataset = Dataset::new("single", "", EvalType::SingleTurn).unwrap();
        let err = dataset
            .append_cases(vec![
                TestCase::single_turn("ok"),
                TestCase::autonomous("not ok"),
            ])
            .unwrap_err();
        assert!(matches!(err, DatasetError::InvalidCase { index: 1, .. }));
        assert_eq!(dataset.num_cases, 0);

        assert!(matches!(
            dataset.append_cases(vec![]),
            Err(DatasetError::EmptyImport)
        ));
    }

    #[test]
    fn test_update_case_out_of_range() {
        let mut dataset = Dataset::new("single", "", EvalType::SingleTurn).unwrap();
        let err = dataset
            .update_case(3, TestCase::single_turn("hi"))
            .unwrap_err();
        assert!(matches!(
            err,
            DatasetError::IndexOutOfRange { index: 3, len: 0 }
        ));
    }

    #[test]
    fn test_parse_cases_json_accepts_both_turn_forms() {
        let json = r#"[
            {"turns": [{"role": "user", "content": "How many vacation days do I have?"}],
             "keywords_any": ["vacation days", "days remaining"],
             "tags": "leave, balance"},
            {"turns": ["Hi"], "expected_topic": "Greeting", "difficulty": "easy"}
        ]"#;
        let cases = parse_cases_json(json).unwrap();
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].keywords_any.len(), 2);
        assert_eq!(cases[0].tags, vec!["leave", "balance"]);
        assert_eq!(cases[1].turns[0], Message::user("Hi"));
        assert_eq!(cases[1].expected_topic.as_deref(), Some("Greeting"));

        assert!(matches!(parse_cases_json("[]"), Err(DatasetError::EmptyImport)));
        assert!(matches!(parse_cases_json("{"), Err(DatasetError::Json(_))));
    }

    #[test]
    fn test_user_utterances() {
        let mut case = TestCase::multi_turn(["first", "second"]);
        case.turns.insert(1, Message::assistant("scripted reply"));
        assert_eq!(case.user_utterances(), vec!["first", "second"]);

        let auto = TestCase::autonomous("Reset my password");
        assert_eq!(auto.user_utterances(), vec!["Reset my password"]);
    }

    #[test]
    fn test_eval_type_round_trip_str() {
        for ty in [EvalType::SingleTurn, EvalType::MultiTurn, EvalType::Autonomous] {
            assert_eq!(ty.as_str().parse::<EvalType>().unwrap(), ty);
        }
        assert!("chat".parse::<EvalType>().is_err());
    }
}
