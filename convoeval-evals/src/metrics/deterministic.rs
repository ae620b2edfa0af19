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

//! Deterministic checks: exact match, keyword match and topic routing.
//!
//! Each check yields a score of 1.0 or 0.0 with `passed` mirroring it,
//! regardless of the run threshold.

use crate::{Metric, MetricContext, MetricError};
use async_trait::async_trait;
use convoeval_core::{Activity, MetricResult};

/// Case-insensitive, whitespace-trimmed equality with the expected output
pub fn exact_match(actual: &str, expected: &str) -> MetricResult {
    let expected = expected.trim();
    if expected.is_empty() {
        return MetricResult::pass("No expected output specified");
    }
    if actual.trim().to_lowercase() == expected.to_lowercase() {
        MetricResult::pass("Exact match")
    } else {
        MetricResult::fail(format!(
            "Expected '{}', got '{}'",
            expected,
            actual.trim()
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordMode {
    Any,
    All,
}

/// Case-insensitive substring search for `keywords` in `actual`.
/// An empty keyword list always passes.
pub fn keyword_match(actual: &str, keywords: &[String], mode: KeywordMode) -> MetricResult {
    let keywords: Vec<&str> = keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .collect();
    if keywords.is_empty() {
        return MetricResult::pass("No keywords specified");
    }

    let haystack = actual.to_lowercase();
    let found = |k: &str| haystack.contains(&k.to_lowercase());

    match mode {
        KeywordMode::Any => match keywords.iter().copied().find(|k| found(k)) {
            Some(keyword) => MetricResult::pass(format!("Found keyword: '{}'", keyword)),
            None => MetricResult::fail(format!(
                "None of the keywords found: {}",
                keywords.join(", ")
            )),
        },
        KeywordMode::All => match keywords.iter().copied().find(|k| !found(k)) {
            Some(missing) => MetricResult::fail(format!("Missing keyword: '{}'", missing)),
            None => MetricResult::pass(format!("All {} keywords found", keywords.len())),
        },
    }
}

fn trailing_segment(topic: &str) -> &str {
    topic.rsplit('.').next().unwrap_or(topic)
}

/// Check that the agent routed to `expected_topic`.
///
/// A routed topic matches when its trailing dotted segment contains the
/// expected topic, ignoring case. An empty expected topic passes.
pub fn topic_routing(activities: &[Activity], expected_topic: &str) -> MetricResult {
    let expected = expected_topic.trim();
    if expected.is_empty() {
        return MetricResult::pass("No expected topic specified");
    }

    let routed: Vec<&str> = activities.iter().filter_map(Activity::routed_topic).collect();
    if routed.is_empty() {
        return MetricResult::fail("No topic routing detected in activities");
    }

    let expected_lower = expected.to_lowercase();
    if let Some(short) = routed
        .iter()
        .map(|t| trailing_segment(t))
        .find(|short| short.to_lowercase().contains(&expected_lower))
    {
        return MetricResult::pass(format!("Routed to: {}", short));
    }

    let shorts: Vec<&str> = routed.iter().map(|t| trailing_segment(t)).collect();
    MetricResult::fail(format!(
        "Expected '{}', got: {}",
        expected,
        shorts.join(", ")
    ))
}

pub struct ExactMatch;

#[async_trait]
impl Metric for ExactMatch {
    fn name(&self) -> &str {
        "exact_match"
    }

    async fn evaluate(&self, ctx: &MetricContext<'_>) -> Result<MetricResult, MetricError> {
        Ok(exact_match(ctx.case.actual_output(), &ctx.case.expected_output))
    }
}

pub struct KeywordMatch {
    mode: KeywordMode,
}

impl KeywordMatch {
    pub fn any() -> Self {
        Self {
            mode: KeywordMode::Any,
        }
    }

    pub fn all() -> Self {
        Self {
            mode: KeywordMode::All,
        }
    }
}

#[async_trait]
impl Metric for KeywordMatch {
    fn name(&self) -> &str {
        match self.mode {
            KeywordMode::Any => "keyword_match_any",
            KeywordMode::All => "keyword_match_all",
        }
    }

    async fn evaluate(&self, ctx: &MetricContext<'_>) -> Result<MetricResult, MetricError> {
        let keywords = match self.mode {
            KeywordMode::Any => &ctx.case.keywords_any,
            KeywordMode::All => &ctx.case.keywords_all,
        };
        Ok(keyword_match(ctx.case.actual_output(), keywords, self.mode))
    }
}

pub struct TopicRouting;

#[async_trait]
impl Metric for TopicRouting {
    fn name(&self) -> &str {
        "topic_routing"
    }

    async fn evaluate(&self, ctx: &MetricContext<'_>) -> Result<MetricResult, MetricError> {
        Ok(topic_routing(&ctx.case.activities, &ctx.case.expected_topic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kws(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exact_match_case_insensitive_and_trimmed() {
        let result = exact_match("  HELLO ", "hello");
        assert_eq!(result.score, 1.0);
        assert!(result.passed);
    }

    #[test]
    fn test_exact_match_miss_mentions_expected() {
        let result = exact_match("Python is great.", "Python is a programming language.");
        assert_eq!(result.score, 0.0);
        assert!(!result.passed);
        assert!(result.reason.contains("Python is a programming language."));
    }

    #[test]
    fn test_exact_match_without_expected_passes() {
        assert!(exact_match("anything", "").passed);
        assert!(exact_match("anything", "   ").passed);
    }

    #[test]
    fn test_keyword_any() {
        let hit = keyword_match(
            "You have 5 vacation days remaining.",
            &kws(&["days remaining", "holiday"]),
            KeywordMode::Any,
        );
        assert!(hit.passed);
        assert!(hit.reason.contains("days remaining"));

        let miss = keyword_match(
            "No relevant content here.",
            &kws(&["days remaining", "vacation"]),
            KeywordMode::Any,
        );
        assert_eq!(miss.score, 0.0);
        assert!(!miss.passed);
    }

    #[test]
    fn test_keyword_empty_list_is_vacuous_pass() {
        assert!(keyword_match("anything", &[], KeywordMode::Any).passed);
        assert!(keyword_match("anything", &[], KeywordMode::All).passed);
    }

    #[test]
    fn test_keyword_all_reports_first_missing() {
        let partial = keyword_match(
            "Policy ID: 123",
            &kws(&["Policy ID:", "expires"]),
            KeywordMode::All,
        );
        assert_eq!(partial.score, 0.0);
        assert!(!partial.passed);
        assert!(partial.reason.contains("expires"));

        let full = keyword_match(
            "Policy ID: 123 expires on 2025-12-31",
            &kws(&["policy id:", "EXPIRES"]),
            KeywordMode::All,
        );
        assert_eq!(full.score, 1.0);
    }

    #[test]
    fn test_topic_routing_suffix_match() {
        let activities = vec![
            Activity::new("typing"),
            Activity::routing("rrs_bot.topic.Greeting"),
        ];
        let result = topic_routing(&activities, "greeting");
        assert!(result.passed);
        assert_eq!(result.reason, "Routed to: Greeting");

        let result = topic_routing(&activities, "ITSupport");
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
        assert!(result.reason.contains("ITSupport"));
        assert!(result.reason.contains("Greeting"));
    }

    #[test]
    fn test_topic_routing_matches_trailing_segment_only() {
        let activities = vec![Activity::routing("rrs_bot.topic.Greeting")];
        assert!(!topic_routing(&activities, "topic").passed);
    }

    #[test]
    fn test_topic_routing_without_activities() {
        let result = topic_routing(&[], "Greeting");
        assert!(!result.passed);
        assert!(result.reason.contains("No topic routing"));

        let result = topic_routing(&[], "");
        assert!(result.passed);
        assert_eq!(result.score, 1.0);
    }
}
