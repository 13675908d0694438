//! Autoresolve CLI - simulate event bursts and inspect configuration.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

use autoresolve_core::{
    alerts::{
        CoalescingScheduler, EvaluationOutcome, GroupId, GroupStore, InMemoryGroupStore,
        PayloadConditionPredicate, ResolveEvaluationJob,
    },
    config::{Config, EngineConfig},
    jobs::JobQueue,
};

// ═══════════════════════════════════════════════════════════════════════════════
// CLI Structure
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Parser)]
#[command(
    name = "autoresolve",
    version,
    about = "Inspect and exercise the alert group auto-resolve engine",
    propagate_version = true
)]
struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Configuration file path
    #[arg(short, long, global = true, env = "AUTORESOLVE_CONFIG")]
    config: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-memory burst of events against one group and report every evaluation
    Simulate {
        /// Number of events in the burst
        #[arg(short, long, default_value = "10")]
        events: usize,

        /// Breaker threshold (defaults to the configured value)
        #[arg(short, long)]
        max_group_size: Option<usize>,

        /// Make the last event a resolve signal
        #[arg(short, long)]
        resolve_last: bool,

        /// Gap between events in milliseconds
        #[arg(short, long, default_value = "10")]
        burst_ms: u64,

        /// Debounce in milliseconds (defaults to the configured value)
        #[arg(short, long)]
        debounce_ms: Option<u64>,
    },

    /// Configuration operations
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Validate the configuration and exit
    Validate,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Output Helpers
// ═══════════════════════════════════════════════════════════════════════════════

struct OutputHelper {
    format: OutputFormat,
}

impl OutputHelper {
    fn new(format: OutputFormat, no_color: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format }
    }

    fn print_success(&self, message: &str) {
        match self.format {
            OutputFormat::Json => println!("{}", json!({ "status": "success", "message": message })),
            OutputFormat::Text => println!("{} {}", "[OK]".green().bold(), message),
        }
    }

    fn print_error(&self, message: &str) {
        match self.format {
            OutputFormat::Json => eprintln!("{}", json!({ "status": "error", "message": message })),
            OutputFormat::Text => eprintln!("{} {}", "[ERROR]".red().bold(), message),
        }
    }

    fn print_table<T: Tabled>(&self, items: &[T]) {
        if items.is_empty() {
            println!("{}", "No evaluations ran.".dimmed());
            return;
        }
        let table = Table::new(items)
            .with(Style::rounded())
            .with(Modify::new(Columns::first()).with(Alignment::right()))
            .to_string();
        println!("{}", table);
    }

    fn print_json<T: Serialize>(&self, data: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(data)?);
        Ok(())
    }

    fn print_header(&self, title: &str) {
        println!();
        println!("{}", title.bold().underline());
        println!();
    }

    fn print_key_value(&self, key: &str, value: &str) {
        println!("  {}: {}", key.cyan(), value);
    }
}

fn colorize_outcome(outcome: &str) -> String {
    match outcome {
        "resolved" => outcome.green().bold().to_string(),
        "breaker_tripped" => outcome.red().bold().to_string(),
        "superseded" => outcome.dimmed().to_string(),
        "group_not_found" => outcome.yellow().to_string(),
        _ => outcome.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Simulate
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Tabled, Serialize)]
struct EvaluationRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Token")]
    token: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Fired after (ms)")]
    fired_after_ms: u64,
}

#[derive(Serialize)]
struct SimulationReport {
    group_id: String,
    events: usize,
    max_group_size: usize,
    debounce_ms: u64,
    evaluations: Vec<EvaluationRow>,
    effective_evaluations: usize,
    final_state: String,
}

async fn handle_simulate(
    config: &Config,
    events: usize,
    max_group_size: Option<usize>,
    resolve_last: bool,
    burst_ms: u64,
    debounce_ms: Option<u64>,
    output: &OutputHelper,
) -> Result<()> {
    let engine = EngineConfig {
        debounce: debounce_ms
            .map(Duration::from_millis)
            .unwrap_or(config.engine.debounce),
        max_group_size: max_group_size.unwrap_or(config.engine.max_group_size),
        predicate_timeout: config.engine.predicate_timeout,
        retry: config.engine.retry.clone(),
    };

    let store = Arc::new(InMemoryGroupStore::new());
    let queue = Arc::new(JobQueue::in_memory());
    let predicate = Arc::new(PayloadConditionPredicate::new(&config.predicate)?);
    let scheduler = CoalescingScheduler::new(store.clone(), predicate, queue.clone(), &engine);

    let group_id = GroupId::new();
    store.create_group(group_id).await?;

    let started = Instant::now();
    for i in 0..events {
        let last = i + 1 == events;
        let status = if last && resolve_last { "resolved" } else { "firing" };
        scheduler
            .record_event(group_id, json!({ "status": status, "n": i }))
            .await?;
        if !last {
            tokio::time::sleep(Duration::from_millis(burst_ms)).await;
        }
    }

    // Drain the queue in ready order, the way the worker would.
    let mut evaluations = Vec::with_capacity(events);
    while queue.stats().await?.pending > 0 {
        let Some(job) = queue.dequeue_due().await? else {
            tokio::time::sleep(Duration::from_millis(5)).await;
            continue;
        };
        let payload = ResolveEvaluationJob::from_data(&job.data)?;
        let outcome: EvaluationOutcome = scheduler
            .run_evaluation(payload.group_id, payload.token)
            .await?;
        evaluations.push(EvaluationRow {
            index: evaluations.len() + 1,
            token: payload.token.to_string()[..8].to_string(),
            outcome: outcome.code().to_string(),
            fired_after_ms: started.elapsed().as_millis() as u64,
        });
    }

    let group = store
        .load(group_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("simulated group vanished"))?;
    let effective = evaluations
        .iter()
        .filter(|row| row.outcome != "superseded")
        .count();

    let report = SimulationReport {
        group_id: group_id.to_string(),
        events,
        max_group_size: engine.max_group_size,
        debounce_ms: engine.debounce.as_millis() as u64,
        evaluations,
        effective_evaluations: effective,
        final_state: group.resolution_state.to_string(),
    };

    match output.format {
        OutputFormat::Json => output.print_json(&report)?,
        OutputFormat::Text => {
            output.print_header("Simulation");
            output.print_key_value("Group", &report.group_id);
            output.print_key_value("Events", &report.events.to_string());
            output.print_key_value("Max group size", &report.max_group_size.to_string());
            output.print_key_value("Debounce", &format!("{}ms", report.debounce_ms));
            println!();

            let rows: Vec<EvaluationRow> = report
                .evaluations
                .into_iter()
                .map(|row| EvaluationRow {
                    outcome: colorize_outcome(&row.outcome),
                    ..row
                })
                .collect();
            output.print_table(&rows);
            println!();
            output.print_success(&format!(
                "{} evaluation(s) fired, {} effective, final state: {}",
                rows.len(),
                report.effective_evaluations,
                report.final_state.as_str().bold()
            ));
        }
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Config
// ═══════════════════════════════════════════════════════════════════════════════

fn load_config(path: Option<&str>) -> Result<Config> {
    Ok(Config::load_from(path)?)
}

async fn handle_config_command(
    cmd: ConfigCommands,
    path: Option<&str>,
    output: &OutputHelper,
) -> Result<()> {
    match cmd {
        ConfigCommands::Show => {
            let config = load_config(path)?;
            output.print_json(&config)?;
        }
        ConfigCommands::Validate => {
            load_config(path)?;
            output.print_success("Configuration is valid");
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let output = OutputHelper::new(cli.format, cli.no_color);

    let result = match cli.command {
        Commands::Simulate {
            events,
            max_group_size,
            resolve_last,
            burst_ms,
            debounce_ms,
        } => {
            let config = load_config(cli.config.as_deref());
            match config {
                Ok(config) => {
                    handle_simulate(
                        &config,
                        events,
                        max_group_size,
                        resolve_last,
                        burst_ms,
                        debounce_ms,
                        &output,
                    )
                    .await
                }
                Err(e) => Err(e),
            }
        }
        Commands::Config(cmd) => handle_config_command(cmd, cli.config.as_deref(), &output).await,
    };

    if let Err(e) = result {
        output.print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
