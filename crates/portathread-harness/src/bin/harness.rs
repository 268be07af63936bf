//! CLI entrypoint for the portathread scenario harness.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use portathread_core::SUBSTRATE;
use portathread_harness::scenarios::{self, SCENARIOS, Scenario, ScenarioConfig};
use portathread_harness::structured_log::{ArtifactIndex, LogEmitter, LogEntry, LogLevel};
use portathread_harness::{HarnessError, Outcome};

/// Scenario runner for portathread primitives.
#[derive(Debug, Parser)]
#[command(name = "portathread-harness")]
#[command(about = "Run portathread scenarios and emit structured evidence")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List available scenarios.
    List,
    /// Run a single scenario.
    Run {
        /// Scenario name (see `list`).
        #[arg(long)]
        scenario: String,
        #[command(flatten)]
        opts: RunOpts,
    },
    /// Run every scenario in order.
    RunAll {
        #[command(flatten)]
        opts: RunOpts,
    },
}

#[derive(Debug, Args)]
struct RunOpts {
    /// Worker threads for racing scenarios.
    #[arg(long, default_value_t = 100)]
    threads: usize,
    /// Per-thread iterations.
    #[arg(long, default_value_t = 1000)]
    iterations: usize,
    /// Duration of the `sleep` scenario in milliseconds.
    #[arg(long, default_value_t = 2500)]
    sleep_ms: u64,
    /// Structured JSONL log path (if omitted, records go to stdout).
    #[arg(long)]
    log: Option<PathBuf>,
    /// Artifact index JSON path; requires `--log`.
    #[arg(long)]
    artifact_index: Option<PathBuf>,
    /// Run identifier used in trace ids.
    #[arg(long)]
    run_id: Option<String>,
}

impl RunOpts {
    fn config(&self) -> ScenarioConfig {
        ScenarioConfig {
            threads: self.threads,
            iterations: self.iterations,
            sleep: Duration::from_millis(self.sleep_ms),
        }
    }
}

fn default_run_id() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("run-{secs}")
}

fn run_scenarios(selected: &[&Scenario], opts: &RunOpts) -> Result<(), Box<dyn std::error::Error>> {
    if opts.artifact_index.is_some() && opts.log.is_none() {
        return Err(HarnessError::InvalidArgument("--artifact-index requires --log".into()).into());
    }
    let run_id = opts.run_id.clone().unwrap_or_else(default_run_id);
    let config = opts.config();
    let mut emitter = match &opts.log {
        Some(path) => LogEmitter::to_file(path, "portathread", &run_id)?,
        None => LogEmitter::to_stdout("portathread", &run_id),
    };

    emitter.emit_entry(
        LogEntry::new(String::new(), LogLevel::Info, "run_start")
            .with_substrate(SUBSTRATE)
            .with_details(serde_json::json!({
                "scenarios": selected.iter().map(|s| s.name).collect::<Vec<_>>(),
                "threads": config.threads,
                "iterations": config.iterations,
                "sleep_ms": opts.sleep_ms,
            })),
    )?;

    let mut failed = Vec::new();
    for scenario in selected {
        eprintln!("[{}] running on {SUBSTRATE}", scenario.name);
        let report = scenario.run(&config);
        eprintln!(
            "[{}] {:?} in {} ms",
            report.name, report.outcome, report.duration_ms
        );
        if report.outcome != Outcome::Pass {
            failed.push(report.name.clone());
        }
        emitter.emit_entry(report.to_log_entry())?;
    }
    emitter.emit(LogLevel::Info, "run_end")?;
    emitter.flush()?;
    drop(emitter);

    if let (Some(index_path), Some(log_path)) = (&opts.artifact_index, &opts.log) {
        write_index(index_path, log_path, &run_id)?;
        eprintln!("Wrote artifact index to {}", index_path.display());
    }

    if !failed.is_empty() {
        return Err(format!("{} scenario(s) did not pass: {}", failed.len(), failed.join(", ")).into());
    }
    Ok(())
}

fn write_index(index_path: &Path, log_path: &Path, run_id: &str) -> Result<(), HarnessError> {
    let mut index = ArtifactIndex::new(run_id);
    index.add_file(log_path, "log")?;
    if let Some(parent) = index_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(index_path, index.to_json()?)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::List => {
            for scenario in SCENARIOS {
                println!("{:<18} {}", scenario.name, scenario.summary);
            }
        }
        Command::Run { scenario, opts } => {
            let scenario = scenarios::find(&scenario)?;
            run_scenarios(&[scenario], &opts)?;
        }
        Command::RunAll { opts } => {
            let all: Vec<&Scenario> = SCENARIOS.iter().collect();
            run_scenarios(&all, &opts)?;
        }
    }
    Ok(())
}
