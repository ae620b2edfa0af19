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

//! Run creation and execution

use convoeval_core::{last_assistant, EvalResult, EvalRun, Message, RunConfig, TestCase};
use convoeval_driver::ConversationDriver;
use convoeval_evals::{CaseInput, MetricRegistry};
use convoeval_storage::{EvalStore, StoreError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Error text recorded on a run whose dataset is gone
pub const DATASET_NOT_FOUND: &str = "Dataset not found";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Run name must not be empty")]
    EmptyName,

    #[error("At least one metric is required")]
    NoMetrics,

    #[error("Dataset not found: {0}")]
    DatasetNotFound(u64),

    #[error("Run not found: {0}")]
    RunNotFound(u64),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Everything a case task needs, shared across tasks
struct CaseRunner {
    store: Arc<EvalStore>,
    driver: Arc<dyn ConversationDriver>,
    registry: Arc<MetricRegistry>,
}

impl CaseRunner {
    async fn run(
        &self,
        run_id: u64,
        index: usize,
        case: &TestCase,
        metrics: &[String],
        threshold: f64,
    ) -> EvalResult {
        let utterances = case.user_utterances();
        let turns: Vec<Message> = utterances
            .iter()
            .map(|u| Message::user(u.as_str()))
            .collect();
        let expected = case.expected_output.clone().unwrap_or_default();

        debug!(run_id, index, turns = turns.len(), "Case started");
        let started = Instant::now();

        let (conversation, activities) = match self.driver.run_conversation(&utterances).await {
            Ok(output) => output,
            Err(e) => {
                warn!(run_id, index, "Case failed: {}", e);
                return EvalResult::errored(run_id, index, turns, expected, e);
            }
        };
        let duration = started.elapsed().as_secs_f64();

        let actual = last_assistant(&conversation).unwrap_or_default().to_string();
        let input = CaseInput::from_case(case, conversation, activities.clone());
        let scores = self.registry.evaluate_case(&input, metrics, threshold).await;

        let result = EvalResult::scored(
            run_id, index, turns, actual, expected, scores, activities, threshold, duration,
        );
        debug!(
            run_id,
            index,
            score = result.score,
            passed = result.passed,
            duration_seconds = result.duration_seconds,
            "Case finished"
        );
        result
    }

    /// Persist a case result off the async workers; the store appends to
    /// its log synchronously under the writer lock.
    async fn record(self: &Arc<Self>, run_id: u64, result: EvalResult) {
        let index = result.test_case_index;
        let runner = Arc::clone(self);
        let written =
            tokio::task::spawn_blocking(move || runner.store.record_result(run_id, result)).await;
        match written {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(run_id, index, "Failed to record case result: {}", e),
            Err(e) => error!(run_id, index, "Result writer task failed: {}", e),
        }
    }
}

/// Drives evaluation runs against a conversation driver and metric registry
pub struct RunExecutor {
    inner: Arc<CaseRunner>,
}

impl RunExecutor {
    pub fn new(
        store: Arc<EvalStore>,
        driver: Arc<dyn ConversationDriver>,
        registry: Arc<MetricRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(CaseRunner {
                store,
                driver,
                registry,
            }),
        }
    }

    pub fn store(&self) -> &Arc<EvalStore> {
        &self.inner.store
    }

    /// Create a pending run over `dataset_id`.
    ///
    /// Metric names the registry does not know are kept on the run and
    /// skipped during scoring.
    pub fn create_run(
        &self,
        name: &str,
        dataset_id: u64,
        metrics: Vec<String>,
        config: RunConfig,
    ) -> Result<EvalRun, RunnerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RunnerError::EmptyName);
        }
        if metrics.is_empty() {
            return Err(RunnerError::NoMetrics);
        }
        let dataset = self
            .inner
            .store
            .get_dataset(dataset_id)
            .ok_or(RunnerError::DatasetNotFound(dataset_id))?;

        for metric in metrics.iter().filter(|m| !self.inner.registry.contains(m)) {
            warn!("Run '{}' names unknown metric '{}'", name, metric);
        }

        let run = EvalRun::new(name, dataset_id, metrics, config, dataset.num_cases);
        Ok(self.inner.store.create_run(run)?)
    }

    /// Execute a pending run to completion.
    ///
    /// Case failures are recorded as failed results and never abort the
    /// run. Only a missing run record or a store failure while marking the
    /// run is returned as an error.
    pub async fn execute_run(&self, run_id: u64) -> Result<(), RunnerError> {
        let store = &self.inner.store;
        let run = store.get_run(run_id).ok_or(RunnerError::RunNotFound(run_id))?;
        let dataset = store.get_dataset(run.dataset_id);
        let case_count = dataset.as_ref().map(|d| d.cases.len());

        let run = store.update_run(run_id, |r| {
            r.start()?;
            if let Some(count) = case_count {
                r.total_cases = count;
            }
            Ok(())
        })?;
        info!(run_id, name = %run.name, total = run.total_cases, "Run started");

        let Some(dataset) = dataset else {
            warn!(run_id, dataset_id = run.dataset_id, "Run failed: dataset not found");
            store.update_run(run_id, |r| r.fail(DATASET_NOT_FOUND))?;
            return Ok(());
        };

        let config = run.config.clone().normalized();
        let metrics = Arc::new(run.metrics.clone());
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        let delay = Duration::from_secs_f64(config.delay_seconds);
        let total = dataset.cases.len();

        let mut tasks: Vec<(usize, TestCase, JoinHandle<()>)> = Vec::with_capacity(total);
        for (index, case) in dataset.cases.into_iter().enumerate() {
            let runner = self.inner.clone();
            let semaphore = semaphore.clone();
            let metrics = metrics.clone();
            let task_case = case.clone();
            let threshold = config.threshold;

            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        let expected = task_case.expected_output.clone().unwrap_or_default();
                        let result = EvalResult::errored(run_id, index, Vec::new(), expected, e);
                        runner.record(run_id, result).await;
                        return;
                    }
                };
                let result = runner
                    .run(run_id, index, &task_case, &metrics, threshold)
                    .await;
                runner.record(run_id, result).await;
            });
            tasks.push((index, case, handle));

            if index + 1 < total && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        for (index, case, handle) in tasks {
            if let Err(e) = handle.await {
                error!(run_id, index, "Case task aborted: {}", e);
                let turns = case
                    .user_utterances()
                    .into_iter()
                    .map(Message::user)
                    .collect();
                let expected = case.expected_output.unwrap_or_default();
                let result = EvalResult::errored(run_id, index, turns, expected, e);
                self.inner.record(run_id, result).await;
            }
        }

        let results = store.get_results(run_id);
        let avg_score = if results.is_empty() {
            0.0
        } else {
            results.iter().map(|r| r.score).sum::<f64>() / results.len() as f64
        };

        let run = store.update_run(run_id, |r| r.complete(avg_score))?;
        info!(
            run_id,
            completed = run.completed_cases,
            total = run.total_cases,
            avg_score = run.avg_score,
            "Run completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use convoeval_core::{Activity, Conversation, Dataset, EvalType, RunStatus};
    use convoeval_driver::DriverError;

    struct EchoDriver;

    #[async_trait]
    impl ConversationDriver for EchoDriver {
        async fn run_conversation(
            &self,
            turns: &[String],
        ) -> Result<(Conversation, Vec<Activity>), DriverError> {
            let mut conversation = Vec::new();
            for turn in turns {
                conversation.push(Message::user(turn.as_str()));
                conversation.push(Message::assistant(format!("echo: {}", turn)));
            }
            Ok((conversation, Vec::new()))
        }
    }

    fn executor() -> RunExecutor {
        RunExecutor::new(
            Arc::new(EvalStore::in_memory()),
            Arc::new(EchoDriver),
            Arc::new(MetricRegistry::deterministic()),
        )
    }

    fn dataset(executor: &RunExecutor, cases: Vec<TestCase>) -> u64 {
        let dataset = Dataset::with_cases("smoke", "", EvalType::SingleTurn, cases).unwrap();
        executor.store().create_dataset(dataset).unwrap().id
    }

    #[test]
    fn test_create_run_validation() {
        let executor = executor();
        let dataset_id = dataset(&executor, vec![TestCase::single_turn("hi")]);
        let metrics = vec!["exact_match".to_string()];

        assert!(matches!(
            executor.create_run("  ", dataset_id, metrics.clone(), RunConfig::default()),
            Err(RunnerError::EmptyName)
        ));
        assert!(matches!(
            executor.create_run("r", dataset_id, Vec::new(), RunConfig::default()),
            Err(RunnerError::NoMetrics)
        ));
        assert!(matches!(
            executor.create_run("r", 999, metrics.clone(), RunConfig::default()),
            Err(RunnerError::DatasetNotFound(999))
        ));

        let run = executor
            .create_run("nightly", dataset_id, metrics, RunConfig::new(0.7, 0.0, 0))
            .unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.total_cases, 1);
        assert_eq!(run.config.max_concurrent, 1);
    }

    #[tokio::test]
    async fn test_execute_run_scores_every_case() {
        let executor = executor();
        let dataset_id = dataset(
            &executor,
            vec![
                TestCase::single_turn("a").with_expected_output("echo: a"),
                TestCase::single_turn("b").with_expected_output("something else"),
            ],
        );
        let run = executor
            .create_run(
                "exact",
                dataset_id,
                vec!["exact_match".to_string()],
                RunConfig::new(0.5, 0.0, 2),
            )
            .unwrap();

        executor.execute_run(run.id).await.unwrap();

        let run = executor.store().get_run(run.id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.completed_cases, 2);
        assert!((run.avg_score - 0.5).abs() < 1e-9);

        let results = executor.store().get_results(run.id);
        assert!(results[0].passed);
        assert!(!results[1].passed);
        assert_eq!(results[0].actual_output, "echo: a");
    }

    #[tokio::test]
    async fn test_execute_unknown_run() {
        assert!(matches!(
            executor().execute_run(42).await,
            Err(RunnerError::RunNotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_run_cannot_execute_twice() {
        let executor = executor();
        let dataset_id = dataset(&executor, vec![TestCase::single_turn("a")]);
        let run = executor
            .create_run(
                "once",
                dataset_id,
                vec!["exact_match".to_string()],
                RunConfig::default(),
            )
            .unwrap();

        executor.execute_run(run.id).await.unwrap();
        assert!(matches!(
            executor.execute_run(run.id).await,
            Err(RunnerError::Store(StoreError::Transition(_)))
        ));
    }
}
