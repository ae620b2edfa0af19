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

//! Adapter exposing judge scoring objects through the [`Metric`] contract

use crate::judge::{JudgeMetric, JudgedKind, LlmJudgeMetric};
use crate::{Metric, MetricContext, MetricError};
use async_trait::async_trait;
use convoeval_core::MetricResult;

/// A metric scored by the judge model; `passed` is `score >= threshold`
pub struct JudgedMetric {
    kind: JudgedKind,
}

impl JudgedMetric {
    pub fn new(kind: JudgedKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Metric for JudgedMetric {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn requires_context(&self) -> bool {
        self.kind.requires_context()
    }

    async fn evaluate(&self, ctx: &MetricContext<'_>) -> Result<MetricResult, MetricError> {
        let client = ctx.judge().await?;
        let test_case = self.kind.test_case(ctx.case);

        let mut scorer = LlmJudgeMetric::new(self.kind, client);
        scorer.measure(&test_case).await?;

        let score = scorer
            .score()
            .ok_or_else(|| MetricError::InvalidInput("judge returned no score".to_string()))?;
        Ok(MetricResult::graded(score, scorer.reason(), ctx.threshold))
    }
}
