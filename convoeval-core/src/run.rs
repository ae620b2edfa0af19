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

//! Evaluation runs and their lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Status of an evaluation run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Created, not yet picked up by the executor
    #[default]
    Pending,

    /// Cases are being processed
    Running,

    /// All cases processed (individual cases may have failed)
    Completed,

    /// Setup failed before any case was processed
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid run transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Per-run execution parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    /// Minimum aggregate score for a case to pass
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Pause between submitting consecutive cases
    #[serde(default = "default_delay_seconds")]
    pub delay_seconds: f64,

    /// Maximum number of cases in flight at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

/// Longest pause allowed between case submissions
pub const MAX_DELAY_SECONDS: f64 = 3600.0;

fn default_threshold() -> f64 {
    0.5
}

fn default_delay_seconds() -> f64 {
    1.0
}

fn default_max_concurrent() -> usize {
    3
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            delay_seconds: default_delay_seconds(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl RunConfig {
    pub fn new(threshold: f64, delay_seconds: f64, max_concurrent: usize) -> Self {
        Self {
            threshold,
            delay_seconds,
            max_concurrent,
        }
        .normalized()
    }

    /// Clamp values into their valid ranges
    /// (`max_concurrent >= 1`, `0 <= delay <= MAX_DELAY_SECONDS`)
    pub fn normalized(mut self) -> Self {
        self.max_concurrent = self.max_concurrent.max(1);
        if self.delay_seconds.is_nan() || self.delay_seconds < 0.0 {
            self.delay_seconds = 0.0;
        }
        self.delay_seconds = self.delay_seconds.min(MAX_DELAY_SECONDS);
        if self.threshold.is_nan() {
            self.threshold = default_threshold();
        }
        self
    }
}

/// A single execution of a metric set against one dataset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalRun {
    /// Identifier assigned by the store (0 until persisted)
    pub id: u64,

    pub name: String,

    pub dataset_id: u64,

    pub status: RunStatus,

    /// Metric names selected for this run
    pub metrics: Vec<String>,

    pub config: RunConfig,

    /// Mean of per-case aggregate scores, set on completion
    pub avg_score: f64,

    /// Dataset size at creation, refreshed when execution starts
    pub total_cases: usize,

    /// Number of cases recorded so far; never decreases
    pub completed_cases: usize,

    #[serde(default)]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl EvalRun {
    /// Create a pending run
    pub fn new(
        name: impl Into<String>,
        dataset_id: u64,
        metrics: Vec<String>,
        config: RunConfig,
        total_cases: usize,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            dataset_id,
            status: RunStatus::Pending,
            metrics,
            config: config.normalized(),
            avg_score: 0.0,
            total_cases,
            completed_cases: 0,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// `pending -> running`
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(RunStatus::Pending, RunStatus::Running)
    }

    /// `running -> completed`
    pub fn complete(&mut self, avg_score: f64) -> Result<(), TransitionError> {
        self.transition(RunStatus::Running, RunStatus::Completed)?;
        self.avg_score = avg_score;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `running -> failed`
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(RunStatus::Running, RunStatus::Failed)?;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, from: RunStatus, to: RunStatus) -> Result<(), TransitionError> {
        if self.status != from {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Fraction of cases recorded so far
    pub fn progress(&self) -> f64 {
        if self.total_cases == 0 {
            return if self.status.is_terminal() { 1.0 } else { 0.0 };
        }
        (self.completed_cases as f64 / self.total_cases as f64).min(1.0)
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
