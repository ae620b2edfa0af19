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

//! Convoeval CLI
//!
//! Manage evaluation datasets, execute runs against a conversational agent
//! and inspect their results.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use convoeval_core::{parse_cases_json, Dataset, EngineConfig, EvalRun, EvalType, RunConfig};
use convoeval_driver::{driver_from_config, ConversationDriver};
use convoeval_evals::retro::{
    evaluate_transcripts, normalize_utterance, suggest_dataset_cases, summarize,
    DatasetSuggestion, RetroCase, RetroExpectations, TranscriptRecord, DEFAULT_MIN_CONFIDENCE,
};
use convoeval_evals::{ConfigJudgeFactory, JudgedKind, MetricRegistry};
use convoeval_runner::RunExecutor;
use convoeval_storage::EvalStore;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "convoeval")]
#[command(about = "Convoeval - evaluation runner for conversational agents", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "CONVOEVAL_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides the configuration)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,

    /// Output as JSON (machine-readable)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dataset management
    Dataset {
        #[command(subcommand)]
        command: DatasetCommands,
    },

    /// Evaluation runs
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },

    /// Show the per-case results of a run
    Results {
        /// Run ID
        run_id: u64,
    },

    /// Score exported transcripts without contacting the agent
    Retro {
        /// JSON file with an array of transcript records
        file: PathBuf,

        /// Only propose new dataset cases
        #[arg(long)]
        suggest_only: bool,

        /// Topic every conversation is expected to route to
        #[arg(long, default_value = "")]
        expected_topic: String,

        /// Expected final agent reply
        #[arg(long, default_value = "")]
        expected_output: String,

        /// Keywords of which at least one must appear (comma-separated)
        #[arg(long, value_delimiter = ',')]
        keywords_any: Vec<String>,

        /// Keywords that must all appear (comma-separated)
        #[arg(long, value_delimiter = ',')]
        keywords_all: Vec<String>,

        /// Minimum intent confidence for inferred topics
        #[arg(long, default_value_t = DEFAULT_MIN_CONFIDENCE)]
        min_confidence: f64,
    },

    /// Send one message to the agent and print the reply
    Ping {
        /// Message to send
        message: String,
    },
}

#[derive(Subcommand)]
enum DatasetCommands {
    /// Create a dataset, optionally importing cases from a JSON file
    Create {
        /// Dataset name
        name: String,

        /// Description
        #[arg(long, default_value = "")]
        description: String,

        /// Evaluation type: single_turn, multi_turn or autonomous
        #[arg(long, default_value = "single_turn")]
        eval_type: String,

        /// JSON file with an array of test cases
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Append test cases from a JSON file
    Import {
        /// Dataset ID
        dataset_id: u64,

        /// JSON file with an array of test cases
        file: PathBuf,
    },

    /// List datasets
    List,

    /// Show a dataset and its cases
    Show {
        /// Dataset ID
        dataset_id: u64,
    },

    /// Delete a dataset
    Delete {
        /// Dataset ID
        dataset_id: u64,
    },
}

#[derive(Subcommand)]
enum RunCommands {
    /// Create a run and execute it
    Start {
        /// Dataset ID
        dataset_id: u64,

        /// Run name
        #[arg(long)]
        name: String,

        /// Metrics to compute (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        metrics: Vec<String>,

        /// Pass threshold for the aggregate case score
        #[arg(long)]
        threshold: Option<f64>,

        /// Seconds to wait between case submissions
        #[arg(long)]
        delay: Option<f64>,

        /// Maximum number of cases in flight
        #[arg(long)]
        max_concurrent: Option<usize>,
    },

    /// List runs, newest first
    List,

    /// Show a run with statistics and per-metric averages
    Show {
        /// Run ID
        run_id: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "convoeval=debug"
    } else {
        "convoeval=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config =
        EngineConfig::load(cli.config.clone()).context("Failed to load configuration")?;
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }

    match cli.command {
        Commands::Retro {
            file,
            suggest_only,
            expected_topic,
            expected_output,
            keywords_any,
            keywords_all,
            min_confidence,
        } => {
            let expect = RetroExpectations {
                expected_topic,
                expected_output,
                keywords_any,
                keywords_all,
            };
            handle_retro(&config, &file, suggest_only, &expect, min_confidence, cli.json)
        }
        Commands::Ping { message } => handle_ping(&config, &message).await,
        Commands::Dataset { command } => {
            let store = open_store(&config)?;
            handle_dataset_command(command, &store, cli.json)
        }
        Commands::Run { command } => handle_run_command(command, &config, cli.json).await,
        Commands::Results { run_id } => {
            let store = open_store(&config)?;
            print_results(&store, run_id, cli.json)
        }
    }
}

fn open_store(config: &EngineConfig) -> Result<EvalStore> {
    EvalStore::open(&config.storage.data_dir).with_context(|| {
        format!(
            "Failed to open data directory {:?}",
            config.storage.data_dir
        )
    })
}

fn read_cases(path: &Path) -> Result<Vec<convoeval_core::TestCase>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    parse_cases_json(&content).with_context(|| format!("Invalid test cases in {:?}", path))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn handle_dataset_command(command: DatasetCommands, store: &EvalStore, json: bool) -> Result<()> {
    match command {
        DatasetCommands::Create {
            name,
            description,
            eval_type,
            file,
        } => {
            let eval_type: EvalType = eval_type.parse()?;
            let cases = match file {
                Some(path) => read_cases(&path)?,
                None => Vec::new(),
            };
            let dataset = Dataset::with_cases(name, description, eval_type, cases)?;
            let dataset = store.create_dataset(dataset)?;
            info!(dataset_id = dataset.id, "Created dataset");

            if json {
                print_json(&dataset)?;
            } else {
                println!(
                    "✓ Created dataset {} '{}' ({} cases)",
                    dataset.id, dataset.name, dataset.num_cases
                );
            }
        }

        DatasetCommands::Import { dataset_id, file } => {
            let cases = read_cases(&file)?;
            let imported = cases.len();
            let dataset = store.update_dataset(dataset_id, |d| d.append_cases(cases))?;

            if json {
                print_json(&dataset)?;
            } else {
                println!(
                    "✓ Imported {} cases into dataset {} (now {} cases)",
                    imported, dataset.id, dataset.num_cases
                );
            }
        }

        DatasetCommands::List => {
            let datasets = store.list_datasets();
            if json {
                return print_json(&datasets);
            }
            if datasets.is_empty() {
                println!("No datasets");
            }
            for dataset in datasets {
                println!(
                    "{:>4}  {:<32} {:<12} {:>5} cases  {}",
                    dataset.id,
                    dataset.name,
                    dataset.eval_type,
                    dataset.num_cases,
                    dataset.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }

        DatasetCommands::Show { dataset_id } => {
            let dataset = store
                .get_dataset(dataset_id)
                .with_context(|| format!("Dataset {} not found", dataset_id))?;
            if json {
                return print_json(&dataset);
            }

            println!("Dataset {}: {}", dataset.id, dataset.name);
            if !dataset.description.is_empty() {
                println!("  {}", dataset.description);
            }
            println!("  Type: {}, Cases: {}", dataset.eval_type, dataset.num_cases);
            for (index, case) in dataset.cases.iter().enumerate() {
                println!("  [{}] {}", index, case.user_utterances().join(" | "));
                if let Some(topic) = &case.expected_topic {
                    println!("      expected topic: {}", topic);
                }
                if let Some(expected) = &case.expected_output {
                    println!("      expected output: {}", expected);
                }
            }
        }

        DatasetCommands::Delete { dataset_id } => {
            store.delete_dataset(dataset_id)?;
            println!("✓ Deleted dataset {}", dataset_id);
        }
    }
    Ok(())
}

async fn handle_run_command(command: RunCommands, config: &EngineConfig, json: bool) -> Result<()> {
    let store = Arc::new(open_store(config)?);

    match command {
        RunCommands::Start {
            dataset_id,
            name,
            metrics,
            threshold,
            delay,
            max_concurrent,
        } => {
            config
                .validate_agent()
                .context("Agent is not configured")?;
            if metrics.iter().any(|m| m.parse::<JudgedKind>().is_ok()) {
                if let Err(e) = config.validate_judge() {
                    warn!("Judged metrics requested but judge is not configured: {}", e);
                }
            }

            let defaults = &config.defaults;
            let run_config = RunConfig::new(
                threshold.unwrap_or(defaults.threshold),
                delay.unwrap_or(defaults.delay_seconds),
                max_concurrent.unwrap_or(defaults.max_concurrent),
            );

            let driver = driver_from_config(config)?;
            let registry = Arc::new(MetricRegistry::builtin(Arc::new(ConfigJudgeFactory::new(
                config.judge.clone(),
            ))));
            let executor = RunExecutor::new(store.clone(), driver, registry);

            let run = executor.create_run(&name, dataset_id, metrics, run_config)?;
            println!("✓ Created run {} ({} cases)", run.id, run.total_cases);

            executor.execute_run(run.id).await?;

            let run = store
                .get_run(run.id)
                .with_context(|| format!("Run {} disappeared", run.id))?;
            print_run(&store, &run, json)?;
        }

        RunCommands::List => {
            let runs = store.list_runs();
            if json {
                return print_json(&runs);
            }
            if runs.is_empty() {
                println!("No runs");
            }
            for run in runs {
                println!(
                    "{:>4}  {:<32} {:<10} {:>4}/{:<4} avg {:.3}  {}",
                    run.id,
                    run.name,
                    run.status,
                    run.completed_cases,
                    run.total_cases,
                    run.avg_score,
                    run.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }

        RunCommands::Show { run_id } => {
            let run = store
                .get_run(run_id)
                .with_context(|| format!("Run {} not found", run_id))?;
            print_run(&store, &run, json)?;
        }
    }
    Ok(())
}

fn print_run(store: &EvalStore, run: &EvalRun, json: bool) -> Result<()> {
    let stats = store.run_stats(run.id);
    let averages = store.metric_averages(run.id);

    if json {
        return print_json(&serde_json::json!({
            "run": run,
            "stats": stats,
            "metric_averages": averages,
        }));
    }

    println!("Run {}: {}", run.id, run.name);
    println!("  Status:    {}", run.status);
    println!("  Dataset:   {}", run.dataset_id);
    println!("  Metrics:   {}", run.metrics.join(", "));
    println!(
        "  Progress:  {}/{} ({:.0}%)",
        run.completed_cases,
        run.total_cases,
        run.progress() * 100.0
    );
    println!("  Avg score: {:.3}", run.avg_score);
    println!(
        "  Passed:    {}  Failed: {}  Errored: {}  Pass rate: {:.1}%",
        stats.passed,
        stats.failed,
        stats.errored,
        stats.pass_rate * 100.0
    );
    if let Some(error) = &run.error {
        println!("  Error:     {}", error);
    }
    for (metric, avg) in averages {
        println!("    {:<24} {:.3}", metric, avg);
    }
    Ok(())
}

fn print_results(store: &EvalStore, run_id: u64, json: bool) -> Result<()> {
    if store.get_run(run_id).is_none() {
        bail!("Run {} not found", run_id);
    }
    let results = store.get_results(run_id);
    if json {
        return print_json(&results);
    }

    for result in results {
        let mark = if result.passed { "✓" } else { "✗" };
        println!(
            "{} [{}] score {:.3} ({:.2}s)",
            mark, result.test_case_index, result.score, result.duration_seconds
        );
        for turn in &result.turns {
            println!("    user:  {}", turn.content);
        }
        println!("    agent: {}", result.actual_output);
        for (name, metric) in &result.scores {
            println!(
                "      {:<22} {:.2} {}",
                name, metric.score, metric.reason
            );
        }
    }
    Ok(())
}

fn handle_retro(
    config: &EngineConfig,
    file: &Path,
    suggest_only: bool,
    expect: &RetroExpectations,
    min_confidence: f64,
    json: bool,
) -> Result<()> {
    let content =
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {:?}", file))?;
    let records: Vec<TranscriptRecord> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid transcript export in {:?}", file))?;
    info!("Loaded {} transcripts", records.len());

    let cases: Vec<RetroCase> = records.iter().filter_map(RetroCase::from_record).collect();

    let existing = existing_utterances(config);
    let suggestions = suggest_dataset_cases(&cases, &existing, min_confidence);

    if suggest_only {
        if json {
            return print_json(&suggestions);
        }
        print_suggestions(&suggestions);
        return Ok(());
    }

    let results = evaluate_transcripts(&records, expect);
    let summary = summarize(&results);

    if json {
        return print_json(&serde_json::json!({
            "summary": summary,
            "results": results,
            "suggestions": suggestions,
        }));
    }

    println!("Evaluated {} transcripts", summary.total);
    for (outcome, count) in &summary.outcomes {
        println!("  {:<20} {}", outcome, count);
    }
    for (metric, (passed, total)) in &summary.metric_passes {
        println!("  {:<20} {}/{} passed", metric, passed, total);
    }
    if let Some(csat) = summary.avg_csat {
        println!("  CSAT: {:.2} ({} responses)", csat, summary.csat_count);
    }
    print_suggestions(&suggestions);
    Ok(())
}

/// Normalized first utterances of every case in existing datasets
fn existing_utterances(config: &EngineConfig) -> HashSet<String> {
    if !config.storage.data_dir.exists() {
        return HashSet::new();
    }
    match EvalStore::open(&config.storage.data_dir) {
        Ok(store) => store
            .list_datasets()
            .iter()
            .flat_map(|d| d.cases.iter())
            .filter_map(|c| c.user_utterances().into_iter().next())
            .map(|u| normalize_utterance(&u))
            .collect(),
        Err(e) => {
            warn!("Could not read existing datasets: {}", e);
            HashSet::new()
        }
    }
}

fn print_suggestions(suggestions: &[DatasetSuggestion]) {
    println!("{} suggested new cases", suggestions.len());
    for suggestion in suggestions {
        let topic = if suggestion.inferred_topic.is_empty() {
            "-"
        } else {
            suggestion.inferred_topic.as_str()
        };
        let multi = if suggestion.is_multi_turn { " (multi-turn)" } else { "" };
        println!("  {}  [{}]{}", suggestion.utterance, topic, multi);
    }
}

async fn handle_ping(config: &EngineConfig, message: &str) -> Result<()> {
    config.validate_agent().context("Agent is not configured")?;
    let driver = driver_from_config(config)?;
    let reply = driver.ping(message).await.context("Agent did not respond")?;
    println!("{}", reply);
    Ok(())
}
