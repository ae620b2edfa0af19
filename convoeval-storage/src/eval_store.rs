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

//! Evaluation Store
//!
//! Datasets, runs and results are indexed in sharded concurrent maps. Writers
//! are serialized by a single mutex so the log order matches the in-memory
//! order; readers only touch the maps and never wait on that mutex.

use crate::log::{
    self, ENTRY_DATASET, ENTRY_DATASET_DELETE, ENTRY_RESULT, ENTRY_RUN,
};
use convoeval_core::{Dataset, DatasetError, EvalResult, EvalRun, TransitionError};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

const LOG_FILE: &str = "convoeval.log";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dataset not found: {0}")]
    DatasetNotFound(u64),

    #[error("Run not found: {0}")]
    RunNotFound(u64),

    #[error("Run {0} is finished and no longer accepts results")]
    RunFinished(u64),

    #[error("Result for case {index} of run {run_id} already recorded")]
    DuplicateResult { run_id: u64, index: usize },

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Pass/fail breakdown of a run's recorded results
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RunStats {
    pub total_results: usize,
    pub passed: usize,
    pub failed: usize,
    /// Cases that failed before they could be scored
    pub errored: usize,
    pub pass_rate: f64,
    pub avg_score: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DatasetDeleted {
    id: u64,
}

pub struct EvalStore {
    datasets: DashMap<u64, Dataset>,
    runs: DashMap<u64, EvalRun>,
    results: DashMap<u64, Vec<EvalResult>>,

    next_dataset_id: AtomicU64,
    next_run_id: AtomicU64,
    next_result_id: AtomicU64,

    /// `None` for an in-memory store
    log_path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl EvalStore {
    /// Create a store that keeps everything in memory
    pub fn in_memory() -> Self {
        Self {
            datasets: DashMap::new(),
            runs: DashMap::new(),
            results: DashMap::new(),
            next_dataset_id: AtomicU64::new(1),
            next_run_id: AtomicU64::new(1),
            next_result_id: AtomicU64::new(1),
            log_path: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Open or create a store in `data_dir`, replaying its log
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;

        let log_path = data_dir.join(LOG_FILE);
        log::init_log(&log_path)?;

        let mut store = Self::in_memory();
        store.replay(&log_path)?;
        store.log_path = Some(log_path);

        tracing::info!(
            datasets = store.datasets.len(),
            runs = store.runs.len(),
            "Opened eval store at {:?}",
            data_dir
        );
        Ok(store)
    }

    fn replay(&mut self, path: &Path) -> Result<(), StoreError> {
        let mut max_dataset = 0;
        let mut max_run = 0;
        let mut max_result = 0;

        for entry in log::read_entries(path)? {
            match entry.kind {
                ENTRY_DATASET => {
                    if let Some(dataset) = entry.decode::<Dataset>() {
                        max_dataset = max_dataset.max(dataset.id);
                        self.datasets.insert(dataset.id, dataset);
                    }
                }
                ENTRY_DATASET_DELETE => {
                    if let Some(deleted) = entry.decode::<DatasetDeleted>() {
                        self.datasets.remove(&deleted.id);
                    }
                }
                ENTRY_RUN => {
                    if let Some(run) = entry.decode::<EvalRun>() {
                        max_run = max_run.max(run.id);
                        self.runs.insert(run.id, run);
                    }
                }
                ENTRY_RESULT => {
                    if let Some(result) = entry.decode::<EvalResult>() {
                        max_result = max_result.max(result.id);
                        self.results
                            .entry(result.eval_run_id)
                            .or_default()
                            .push(result);
                    }
                }
                other => {
                    tracing::warn!("Unknown entry type {} in store log", other);
                }
            }
        }

        for run in self.runs.iter().filter(|r| r.is_running()) {
            tracing::warn!(
                run_id = run.id,
                completed = run.completed_cases,
                total = run.total_cases,
                "Run was interrupted while running"
            );
        }

        self.next_dataset_id = AtomicU64::new(max_dataset + 1);
        self.next_run_id = AtomicU64::new(max_run + 1);
        self.next_result_id = AtomicU64::new(max_result + 1);
        Ok(())
    }

    fn append(&self, frames: &[Vec<u8>]) -> Result<(), StoreError> {
        if let Some(path) = &self.log_path {
            log::append_frames(path, frames)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Datasets
    // ------------------------------------------------------------------

    /// Persist a new dataset and assign its id
    pub fn create_dataset(&self, mut dataset: Dataset) -> Result<Dataset, StoreError> {
        let _guard = self.write_lock.lock();
        dataset.id = self.next_dataset_id.fetch_add(1, Ordering::SeqCst);
        dataset.num_cases = dataset.cases.len();

        self.append(&[log::encode_entry(ENTRY_DATASET, &dataset)?])?;
        self.datasets.insert(dataset.id, dataset.clone());

        tracing::debug!(dataset_id = dataset.id, cases = dataset.num_cases, "Created dataset");
        Ok(dataset)
    }

    pub fn get_dataset(&self, id: u64) -> Option<Dataset> {
        self.datasets.get(&id).map(|d| d.clone())
    }

    /// All datasets ordered by id
    pub fn list_datasets(&self) -> Vec<Dataset> {
        let mut datasets: Vec<Dataset> = self.datasets.iter().map(|d| d.clone()).collect();
        datasets.sort_by_key(|d| d.id);
        datasets
    }

    /// Apply an edit to a dataset. The edit runs on a copy; nothing changes
    /// if it fails.
    pub fn update_dataset<F>(&self, id: u64, edit: F) -> Result<Dataset, StoreError>
    where
        F: FnOnce(&mut Dataset) -> Result<(), DatasetError>,
    {
        let _guard = self.write_lock.lock();
        let mut dataset = self
            .get_dataset(id)
            .ok_or(StoreError::DatasetNotFound(id))?;
        edit(&mut dataset)?;
        dataset.num_cases = dataset.cases.len();

        self.append(&[log::encode_entry(ENTRY_DATASET, &dataset)?])?;
        self.datasets.insert(id, dataset.clone());
        Ok(dataset)
    }

    pub fn delete_dataset(&self, id: u64) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        if !self.datasets.contains_key(&id) {
            return Err(StoreError::DatasetNotFound(id));
        }
        self.append(&[log::encode_entry(
            ENTRY_DATASET_DELETE,
            &DatasetDeleted { id },
        )?])?;
        self.datasets.remove(&id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Persist a new run and assign its id
    pub fn create_run(&self, mut run: EvalRun) -> Result<EvalRun, StoreError> {
        let _guard = self.write_lock.lock();
        run.id = self.next_run_id.fetch_add(1, Ordering::SeqCst);

        self.append(&[log::encode_entry(ENTRY_RUN, &run)?])?;
        self.runs.insert(run.id, run.clone());

        tracing::debug!(run_id = run.id, dataset_id = run.dataset_id, "Created run");
        Ok(run)
    }

    pub fn get_run(&self, id: u64) -> Option<EvalRun> {
        self.runs.get(&id).map(|r| r.clone())
    }

    /// All runs, newest first
    pub fn list_runs(&self) -> Vec<EvalRun> {
        let mut runs: Vec<EvalRun> = self.runs.iter().map(|r| r.clone()).collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        runs
    }

    /// Apply a lifecycle change to a run and persist it immediately
    pub fn update_run<F>(&self, id: u64, change: F) -> Result<EvalRun, StoreError>
    where
        F: FnOnce(&mut EvalRun) -> Result<(), TransitionError>,
    {
        let _guard = self.write_lock.lock();
        let mut run = self.get_run(id).ok_or(StoreError::RunNotFound(id))?;
        change(&mut run)?;

        self.append(&[log::encode_entry(ENTRY_RUN, &run)?])?;
        self.runs.insert(id, run.clone());
        Ok(run)
    }

    // ------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------

    /// Append a case result and bump the run's `completed_cases` in one step
    pub fn record_result(
        &self,
        run_id: u64,
        mut result: EvalResult,
    ) -> Result<EvalResult, StoreError> {
        let _guard = self.write_lock.lock();
        let mut run = self.get_run(run_id).ok_or(StoreError::RunNotFound(run_id))?;
        if run.is_finished() {
            return Err(StoreError::RunFinished(run_id));
        }

        let duplicate = self.results.get(&run_id).map_or(false, |existing| {
            existing
                .iter()
                .any(|r| r.test_case_index == result.test_case_index)
        });
        if duplicate {
            return Err(StoreError::DuplicateResult {
                run_id,
                index: result.test_case_index,
            });
        }

        result.id = self.next_result_id.fetch_add(1, Ordering::SeqCst);
        result.eval_run_id = run_id;
        run.completed_cases += 1;

        self.append(&[
            log::encode_entry(ENTRY_RESULT, &result)?,
            log::encode_entry(ENTRY_RUN, &run)?,
        ])?;

        self.results
            .entry(run_id)
            .or_default()
            .push(result.clone());
        self.runs.insert(run_id, run);
        Ok(result)
    }

    /// Results of a run ordered by case index
    pub fn get_results(&self, run_id: u64) -> Vec<EvalResult> {
        let mut results = self
            .results
            .get(&run_id)
            .map(|r| r.clone())
            .unwrap_or_default();
        results.sort_by_key(|r| r.test_case_index);
        results
    }

    /// Mean score per metric across a run's results
    pub fn metric_averages(&self, run_id: u64) -> BTreeMap<String, f64> {
        let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        if let Some(results) = self.results.get(&run_id) {
            for result in results.iter() {
                for (name, metric) in &result.scores {
                    let entry = sums.entry(name.clone()).or_insert((0.0, 0));
                    entry.0 += metric.score;
                    entry.1 += 1;
                }
            }
        }
        sums.into_iter()
            .map(|(name, (sum, count))| (name, sum / count as f64))
            .collect()
    }

    pub fn run_stats(&self, run_id: u64) -> RunStats {
        let results = self.get_results(run_id);
        if results.is_empty() {
            return RunStats::default();
        }

        let total_results = results.len();
        let passed = results.iter().filter(|r| r.passed).count();
        let errored = results.iter().filter(|r| r.is_error()).count();
        let avg_score = results.iter().map(|r| r.score).sum::<f64>() / total_results as f64;

        RunStats {
            total_results,
            passed,
            failed: total_results - passed,
            errored,
            pass_rate: passed as f64 / total_results as f64,
            avg_score,
        }
    }

    /// Rewrite the log so it holds only the current state
    pub fn compact(&self) -> Result<(), StoreError> {
        let Some(path) = &self.log_path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock();

        let mut frames = Vec::new();
        for dataset in self.list_datasets() {
            frames.push(log::encode_entry(ENTRY_DATASET, &dataset)?);
        }
        let mut runs = self.list_runs();
        runs.reverse();
        for run in runs {
            for result in self.get_results(run.id) {
                frames.push(log::encode_entry(ENTRY_RESULT, &result)?);
            }
            frames.push(log::encode_entry(ENTRY_RUN, &run)?);
        }

        log::rewrite_log(path, &frames)?;
        tracing::info!(entries = frames.len(), "Compacted eval store log");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoeval_core::{EvalType, MetricResult, Message, RunConfig, ScoreMap, TestCase};

    fn sample_dataset() -> Dataset {
        Dataset::with_cases(
            "HR questions",
            "",
            EvalType::SingleTurn,
            vec![
                TestCase::single_turn("How many vacation days do I have?"),
                TestCase::single_turn("What is the parental leave policy?"),
            ],
        )
        .unwrap()
    }

    fn sample_result(index: usize, score: f64) -> EvalResult {
        let mut scores = ScoreMap::new();
        scores.insert(
            "exact_match".to_string(),
            MetricResult::check(score >= 1.0, "checked"),
        );
        EvalResult::scored(
            0,
            index,
            vec![Message::user("hi")],
            "hello".to_string(),
            String::new(),
            scores,
            Vec::new(),
            0.5,
            1.234,
        )
    }

    fn running_run(store: &EvalStore, dataset_id: u64) -> EvalRun {
        let run = store
            .create_run(EvalRun::new(
                "run",
                dataset_id,
                vec!["exact_match".to_string()],
                RunConfig::default(),
                2,
            ))
            .unwrap();
        store.update_run(run.id, |r| r.start()).unwrap()
    }

    #[test]
    fn test_dataset_crud() {
        let store = EvalStore::in_memory();
        let dataset = store.create_dataset(sample_dataset()).unwrap();
        assert_eq!(dataset.id, 1);
        assert_eq!(dataset.num_cases, 2);

        let updated = store
            .update_dataset(dataset.id, |d| d.add_case(TestCase::single_turn("Where is HR?")))
            .unwrap();
        assert_eq!(updated.num_cases, 3);

        let err = store.update_dataset(dataset.id, |d| {
            d.add_case(TestCase::multi_turn(["a", "b"]))
        });
        assert!(matches!(err, Err(StoreError::Dataset(_))));
        assert_eq!(store.get_dataset(dataset.id).unwrap().num_cases, 3);

        store.delete_dataset(dataset.id).unwrap();
        assert!(store.get_dataset(dataset.id).is_none());
        assert!(matches!(
            store.delete_dataset(dataset.id),
            Err(StoreError::DatasetNotFound(_))
        ));
    }

    #[test]
    fn test_record_result_increments_progress() {
        let store = EvalStore::in_memory();
        let dataset = store.create_dataset(sample_dataset()).unwrap();
        let run = running_run(&store, dataset.id);

        let stored = store.record_result(run.id, sample_result(1, 0.0)).unwrap();
        assert_eq!(stored.eval_run_id, run.id);
        assert_eq!(store.get_run(run.id).unwrap().completed_cases, 1);

        store.record_result(run.id, sample_result(0, 1.0)).unwrap();
        assert_eq!(store.get_run(run.id).unwrap().completed_cases, 2);

        let results = store.get_results(run.id);
        assert_eq!(
            results.iter().map(|r| r.test_case_index).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(results[0].duration_seconds, 1.23);
    }

    #[test]
    fn test_result_is_immutable_once_recorded() {
        let store = EvalStore::in_memory();
        let dataset = store.create_dataset(sample_dataset()).unwrap();
        let run = running_run(&store, dataset.id);

        store.record_result(run.id, sample_result(0, 1.0)).unwrap();
        assert!(matches!(
            store.record_result(run.id, sample_result(0, 0.0)),
            Err(StoreError::DuplicateResult { index: 0, .. })
        ));

        store.update_run(run.id, |r| r.complete(1.0)).unwrap();
        assert!(matches!(
            store.record_result(run.id, sample_result(1, 1.0)),
            Err(StoreError::RunFinished(_))
        ));
        assert_eq!(store.get_run(run.id).unwrap().completed_cases, 1);
    }

    #[test]
    fn test_record_result_for_unknown_run() {
        let store = EvalStore::in_memory();
        assert!(matches!(
            store.record_result(42, sample_result(0, 1.0)),
            Err(StoreError::RunNotFound(42))
        ));
    }

    #[test]
    fn test_invalid_transition_is_not_persisted() {
        let store = EvalStore::in_memory();
        let run = store
            .create_run(EvalRun::new("r", 1, vec![], RunConfig::default(), 0))
            .unwrap();
        assert!(matches!(
            store.update_run(run.id, |r| r.complete(1.0)),
            Err(StoreError::Transition(_))
        ));
        assert_eq!(
            store.get_run(run.id).unwrap().status,
            convoeval_core::RunStatus::Pending
        );
    }

    #[test]
    fn test_metric_averages_and_stats() {
        let store = EvalStore::in_memory();
        let dataset = store.create_dataset(sample_dataset()).unwrap();
        let run = running_run(&store, dataset.id);

        store.record_result(run.id, sample_result(0, 1.0)).unwrap();
        store.record_result(run.id, sample_result(1, 0.0)).unwrap();

        let averages = store.metric_averages(run.id);
        assert_eq!(averages.get("exact_match"), Some(&0.5));

        let stats = store.run_stats(run.id);
        assert_eq!(stats.total_results, 2);
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.errored, 0);
        assert!((stats.pass_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_list_runs_newest_first() {
        let store = EvalStore::in_memory();
        let first = store
            .create_run(EvalRun::new("first", 1, vec![], RunConfig::default(), 0))
            .unwrap();
        let second = store
            .create_run(EvalRun::new("second", 1, vec![], RunConfig::default(), 0))
            .unwrap();

        let ids: Vec<u64> = store.list_runs().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }
}
