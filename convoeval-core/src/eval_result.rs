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

use crate::conversation::{Activity, Message};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Per-metric scores of one case, keyed by metric name
pub type ScoreMap = BTreeMap<String, MetricResult>;

/// Uniform output of every metric
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricResult {
    /// Score in `[0, 1]`
    pub score: f64,

    /// Human-readable explanation
    pub reason: String,

    pub passed: bool,
}

impl MetricResult {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            score: 1.0,
            reason: reason.into(),
            passed: true,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            reason: reason.into(),
            passed: false,
        }
    }

    /// Result of a deterministic boolean check: score is 1.0 or 0.0 and
    /// `passed` mirrors it.
    pub fn check(ok: bool, reason: impl Into<String>) -> Self {
        if ok {
            Self::pass(reason)
        } else {
            Self::fail(reason)
        }
    }

    /// Result of a graded metric compared against `threshold`
    pub fn graded(score: f64, reason: impl Into<String>, threshold: f64) -> Self {
        let score = if score.is_nan() {
            0.0
        } else {
            score.clamp(0.0, 1.0)
        };
        Self {
            score,
            reason: reason.into(),
            passed: score >= threshold,
        }
    }

    /// Metric-level failure surfaced as a zero score
    pub fn error(error: impl fmt::Display) -> Self {
        Self::fail(format!("Error: {}", error))
    }
}

/// Arithmetic mean of all metric scores; 0.0 when nothing was scored
pub fn aggregate_score(scores: &ScoreMap) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.values().map(|s| s.score).sum::<f64>() / scores.len() as f64
}

/// Outcome of one case within one run. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalResult {
    /// Identifier assigned by the store (0 until persisted)
    pub id: u64,

    pub eval_run_id: u64,

    /// Ordinal of the case in the dataset when the run started
    pub test_case_index: usize,

    /// Turns that were sent to the agent
    pub turns: Vec<Message>,

    pub actual_output: String,

    pub expected_output: String,

    pub scores: ScoreMap,

    /// Aggregate case score (mean of `scores`)
    pub score: f64,

    /// Raw activities captured during the conversation
    #[serde(default)]
    pub activities: Vec<Activity>,

    pub passed: bool,

    pub duration_seconds: f64,

    pub created_at: DateTime<Utc>,
}

impl EvalResult {
    /// Build a scored result; `passed` is the aggregate compared to `threshold`
    #[allow(clippy::too_many_arguments)]
    pub fn scored(
        eval_run_id: u64,
        test_case_index: usize,
        turns: Vec<Message>,
        actual_output: String,
        expected_output: String,
        scores: ScoreMap,
        activities: Vec<Activity>,
        threshold: f64,
        duration_seconds: f64,
    ) -> Self {
        let score = aggregate_score(&scores);
        Self {
            id: 0,
            eval_run_id,
            test_case_index,
            turns,
            actual_output,
            expected_output,
            scores,
            score,
            activities,
            passed: score >= threshold,
            duration_seconds: (duration_seconds * 100.0).round() / 100.0,
            created_at: Utc::now(),
        }
    }

    /// Build the result recorded when a case could not be executed
    pub fn errored(
        eval_run_id: u64,
        test_case_index: usize,
        turns: Vec<Message>,
        expected_output: String,
        error: impl fmt::Display,
    ) -> Self {
        Self {
            id: 0,
            eval_run_id,
            test_case_index,
            turns,
            actual_output: format!("Error: {}", error),
            expected_output,
            scores: ScoreMap::new(),
            score: 0.0,
            activities: Vec::new(),
            passed: false,
            duration_seconds: 0.0,
            created_at: Utc::now(),
        }
    }

    /// Whether the case failed before it could be scored
    pub fn is_error(&self) -> bool {
        self.scores.is_empty() && self.actual_output.starts_with("Error: ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_mirrors_score() {
        let ok = MetricResult::check(true, "matched");
        assert_eq!(ok.score, 1.0);
        assert!(ok.passed);

        let miss = MetricResult::check(false, "missing");
        assert_eq!(miss.score, 0.0);
        assert!(!miss.passed);
    }

    #[test]
    fn test_graded_clamps_and_compares() {
        let r = MetricResult::graded(1.4, "great", 0.5);
        assert_eq!(r.score, 1.0);
        assert!(r.passed);

        let r = MetricResult::graded(0.49, "meh", 0.5);
        assert!(!r.passed);

        let r = MetricResult::graded(f64::NAN, "bad judge", 0.5);
        assert_eq!(r.score, 0.0);
    }

    #[test]
    fn test_aggregate_score() {
        let mut scores = ScoreMap::new();
        assert_eq!(aggregate_score(&scores), 0.0);

        scores.insert("a".to_string(), MetricResult::pass("ok"));
        scores.insert("b".to_string(), MetricResult::fail("no"));
        assert!((aggregate_score(&scores) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_scored_result_uses_threshold() {
        let mut scores = ScoreMap::new();
        scores.insert("keyword_match_any".to_string(), MetricResult::pass("found"));
        let result = EvalResult::scored(
            7,
            0,
            vec![Message::user("hi")],
            "hello".to_string(),
            String::new(),
            scores,
            Vec::new(),
            0.5,
            1.23456,
        );
        assert!(result.passed);
        assert_eq!(result.score, 1.0);
        assert_eq!(result.duration_seconds, 1.23);
        assert!(!result.is_error());
    }

    #[test]
    fn test_errored_result() {
        let result = EvalResult::errored(7, 2, vec![], "expected".to_string(), "agent unreachable");
        assert!(!result.passed);
        assert!(result.scores.is_empty());
        assert_eq!(result.actual_output, "Error: agent unreachable");
        assert_eq!(result.duration_seconds, 0.0);
        assert!(result.is_error());
    }
}
