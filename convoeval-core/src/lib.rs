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

//! Convoeval Core
//!
//! Data model shared by the evaluation workspace: conversations and agent
//! activities, datasets of test cases, evaluation runs and their per-case
//! results, and engine configuration.

pub mod config;
pub mod conversation;
pub mod dataset;
pub mod eval_result;
pub mod run;

pub use config::{
    AgentConfig, AuthConfig, ConfigError, EngineConfig, JudgeConfig, JudgeProvider, StorageConfig,
};
pub use conversation::{
    last_assistant, last_user, Activity, Conversation, Message, Role, DYNAMIC_PLAN_STEP_TRIGGERED,
};
pub use dataset::{parse_cases_json, Dataset, DatasetError, EvalType, TestCase};
pub use eval_result::{aggregate_score, EvalResult, MetricResult, ScoreMap};
pub use run::{EvalRun, RunConfig, RunStatus, TransitionError, MAX_DELAY_SECONDS};
