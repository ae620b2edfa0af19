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

//! Name-keyed metric registry and case evaluation

use crate::judge::{JudgeFactory, JudgedKind, LazyJudge};
use crate::metrics::{ExactMatch, JudgedMetric, KeywordMatch, TopicRouting};
use crate::{CaseInput, Metric, MetricContext};
use convoeval_core::{MetricResult, ScoreMap};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Names of the metrics that never call the judge
pub const DETERMINISTIC_METRICS: [&str; 4] = [
    "exact_match",
    "keyword_match_any",
    "keyword_match_all",
    "topic_routing",
];

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Duplicate metric name: {0}")]
    DuplicateName(String),
}

/// Registry for managing and dispatching metrics by name
pub struct MetricRegistry {
    metrics: RwLock<HashMap<String, Arc<dyn Metric>>>,
    judge_factory: Option<Arc<dyn JudgeFactory>>,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricRegistry {
    /// Empty registry without a judge
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            judge_factory: None,
        }
    }

    /// Registry holding only the deterministic metrics
    pub fn deterministic() -> Self {
        let registry = Self::new();
        let metrics: [Arc<dyn Metric>; 4] = [
            Arc::new(ExactMatch),
            Arc::new(KeywordMatch::any()),
            Arc::new(KeywordMatch::all()),
            Arc::new(TopicRouting),
        ];
        registry.metrics.write().extend(
            metrics
                .into_iter()
                .map(|m| (m.name().to_string(), m)),
        );
        registry
    }

    /// Every built-in metric, with judged metrics using `factory`
    pub fn builtin(factory: Arc<dyn JudgeFactory>) -> Self {
        let mut registry = Self::deterministic();
        registry.judge_factory = Some(factory);
        {
            let mut metrics = registry.metrics.write();
            for kind in JudgedKind::ALL {
                metrics.insert(kind.name().to_string(), Arc::new(JudgedMetric::new(kind)));
            }
        }
        registry
    }

    /// Register a new metric
    pub fn register(&self, metric: Arc<dyn Metric>) -> Result<(), RegistryError> {
        let name = metric.name().to_string();
        let mut metrics = self.metrics.write();

        if metrics.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }

        info!("Registering metric: {}", name);
        metrics.insert(name, metric);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Metric>> {
        self.metrics.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.metrics.read().contains_key(name)
    }

    /// Registered metric names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.metrics.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Score one case with the requested metrics.
    ///
    /// Unknown names are logged and left out of the result. A failing metric
    /// yields a zero score carrying the error text. The judge client is
    /// created only if a judged metric runs, and at most once per call.
    pub async fn evaluate_case(
        &self,
        case: &CaseInput,
        metric_names: &[String],
        threshold: f64,
    ) -> ScoreMap {
        let judge = LazyJudge::new(self.judge_factory.clone());
        let ctx = MetricContext::new(case, threshold, &judge);
        let mut scores = ScoreMap::new();

        for name in metric_names {
            if scores.contains_key(name) {
                continue;
            }

            let Some(metric) = self.get(name) else {
                warn!("Unknown metric: {}", name);
                continue;
            };

            if metric.requires_context() && case.context.trim().is_empty() {
                scores.insert(
                    name.clone(),
                    MetricResult::fail(format!("Metric '{}' requires context in test case", name)),
                );
                continue;
            }

            let result = match metric.evaluate(&ctx).await {
                Ok(result) => {
                    debug!("Metric {}: {:.3}", name, result.score);
                    result
                }
                Err(e) => {
                    error!("Metric {} failed: {}", name, e);
                    MetricResult::error(e)
                }
            };
            scores.insert(name.clone(), result);
        }

        scores
    }
}
