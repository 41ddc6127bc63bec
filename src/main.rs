//! kdispatch CLI - kernel/BSP test dispatcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use kdispatch::config::{self, Config, ProviderConfig, StoreConfig};
use kdispatch::model::{EnvironmentRecord, EnvironmentState};
use kdispatch::orchestrator::{Orchestrator, OutputCallback};
use kdispatch::provider::command::CommandProvider;
use kdispatch::provider::local::LocalProvider;
use kdispatch::provider::{OutputLine, SandboxProvider};
use kdispatch::report;
use kdispatch::status::{self, OrchestratorStatus};
use kdispatch::store::PlanStore;
use kdispatch::store::persist::{
    EntityKind, JsonDirPersistence, MemoryPersistence, Persistence, load_entities,
};

#[derive(Parser)]
#[command(name = "kdispatch")]
#[command(about = "Dispatches kernel/BSP tests onto virtual hardware", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "kdispatch.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run plans to completion
    Run {
        /// Plan files (TOML)
        #[arg(required = true)]
        plans: Vec<PathBuf>,

        /// Print script output as it is produced
        #[arg(long)]
        stream: bool,

        /// Override the JUnit output directory
        #[arg(long)]
        junit_dir: Option<PathBuf>,
    },

    /// Show plan status from the persisted store
    Status {
        /// Only this plan
        plan: Option<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show queue and pool metrics from the persisted store
    Metrics {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Remove finished executions older than a threshold
    Cleanup {
        #[arg(long, default_value_t = 24 * 7)]
        max_age_hours: u64,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Backend type (local, command)
        #[arg(short, long, default_value = "local")]
        provider: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            plans,
            stream,
            junit_dir,
        } => run_plans(&cli.config, &plans, stream, junit_dir).await,
        Commands::Status { plan, json } => show_status(&cli.config, plan.as_deref(), json),
        Commands::Metrics { json } => show_metrics(&cli.config, json),
        Commands::Cleanup { max_age_hours } => cleanup(&cli.config, max_age_hours),
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { provider } => init_config(&provider),
    }
}

fn open_persistence(store: &StoreConfig) -> Result<Arc<dyn Persistence>> {
    match store.resolved_path()? {
        None => Ok(Arc::new(MemoryPersistence::new())),
        Some(path) => Ok(Arc::new(JsonDirPersistence::open(&path).with_context(
            || format!("Failed to open store at {}", path.display()),
        )?)),
    }
}

async fn run_plans(
    config_path: &Path,
    plan_paths: &[PathBuf],
    stream: bool,
    junit_dir: Option<PathBuf>,
) -> Result<()> {
    let config = config::load_config(config_path)?;
    info!("Loaded configuration from {}", config_path.display());

    let submissions = plan_paths
        .iter()
        .map(|path| config::load_plan(path))
        .collect::<Result<Vec<_>>>()?;

    match &config.provider {
        ProviderConfig::Local(cfg) => {
            let provider = LocalProvider::new(cfg.clone());
            run_with(config, provider, submissions, stream, junit_dir).await
        }
        ProviderConfig::Command(cfg) => {
            let provider = CommandProvider::new(
                cfg.clone(),
                Duration::from_secs(config.pool.provision_timeout_secs),
            );
            run_with(config, provider, submissions, stream, junit_dir).await
        }
    }
}

async fn run_with<P: SandboxProvider>(
    config: Config,
    provider: P,
    submissions: Vec<kdispatch::PlanSubmission>,
    stream: bool,
    junit_dir: Option<PathBuf>,
) -> Result<()> {
    let persistence = open_persistence(&config.store)?;
    let total: usize = submissions.iter().map(|s| s.test_cases.len()).sum();

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("Invalid progress template")?
            .progress_chars("#>-"),
    );

    let mut orchestrator = Orchestrator::new(&config, provider, persistence)?;
    if stream {
        let printer = pb.clone();
        let callback: OutputCallback = Arc::new(move |record: &str, line: &OutputLine| match line {
            OutputLine::Stdout(s) => printer.println(format!("[{}] {}", record, s)),
            OutputLine::Stderr(s) => printer.println(format!(
                "[{}] {}",
                record,
                console::style(s).yellow()
            )),
            OutputLine::ExitCode(_) => {}
        });
        orchestrator = orchestrator.with_output_callback(callback);
    }
    let handle = orchestrator.handle();
    let task = tokio::spawn(orchestrator.run());

    let mut plan_ids = Vec::with_capacity(submissions.len());
    for submission in submissions {
        let held = !submission.auto_start;
        let plan = handle
            .submit_plan(submission)
            .context("Failed to submit plan")?;
        if held {
            handle.start_execution(&plan.id)?;
        }
        info!(plan = %plan.id, priority = plan.priority, "Submitted plan");
        plan_ids.push(plan.id);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    loop {
        let reports = plan_ids
            .iter()
            .map(|id| handle.execution_status(id))
            .collect::<Result<Vec<_>, _>>()?;
        let finished: usize = reports
            .iter()
            .map(|r| r.completed_tests + r.failed_tests + r.cancelled_tests)
            .sum();
        let running: usize = reports.iter().map(|r| r.running_tests).sum();
        pb.set_position(finished as u64);
        pb.set_message(format!("{} running", running));

        if reports.iter().all(|r| r.overall_status.is_terminal()) {
            break;
        }

        tokio::select! {
            result = &mut ctrl_c, if !interrupted => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                interrupted = true;
                pb.println("Interrupted; cancelling plans");
                for id in &plan_ids {
                    handle.cancel_execution(id)?;
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
        }
    }
    pb.finish_and_clear();

    handle.shutdown();
    task.await.context("Orchestrator task failed")?;

    let junit_dir = junit_dir.unwrap_or_else(|| config.report.output_dir.clone());
    let mut reports = Vec::with_capacity(plan_ids.len());
    for id in &plan_ids {
        let report = handle.execution_status(id)?;
        let records = handle.records(id);
        report::print_summary(&report, &records);

        if config.report.junit {
            let plan = handle.store().get_plan(id)?;
            let path = report::write_junit(&junit_dir, &plan, &records)?;
            println!("JUnit report: {}", path.display());
        }
        reports.push(report);
    }

    std::process::exit(report::exit_code(&reports));
}

/// Opens the persisted store without running the orchestrator.
fn open_store(config_path: &Path) -> Result<(PlanStore, Arc<dyn Persistence>)> {
    let config = config::load_config(config_path)?;
    if matches!(config.store, StoreConfig::Memory) {
        warn!("The memory store keeps nothing between runs");
    }
    let persistence = open_persistence(&config.store)?;
    let store = PlanStore::open(persistence.clone())?;
    Ok((store, persistence))
}

fn show_status(config_path: &Path, plan: Option<&str>, json: bool) -> Result<()> {
    let (store, _) = open_store(config_path)?;
    let reports = match plan {
        Some(id) => vec![status::execution_status(&store, id)?],
        None => status::all_executions(&store),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }
    if reports.is_empty() {
        println!("No executions.");
        return Ok(());
    }
    for r in &reports {
        println!(
            "{:<24} {:<10} {:>5.1}%  {} passed, {} failed, {} cancelled, {} running, {} queued",
            r.plan_id,
            r.overall_status.to_string(),
            r.progress * 100.0,
            r.completed_tests,
            r.failed_tests,
            r.cancelled_tests,
            r.running_tests,
            r.queued_tests,
        );
    }
    Ok(())
}

fn show_metrics(config_path: &Path, json: bool) -> Result<()> {
    let (store, persistence) = open_store(config_path)?;
    let environments: Vec<EnvironmentRecord> =
        load_entities(persistence.as_ref(), EntityKind::Environment)?;
    let available = environments
        .iter()
        .filter(|e| e.state == EnvironmentState::Ready && e.reserved_for.is_none())
        .count();
    let metrics = status::metrics(&store, OrchestratorStatus::Stopped, available);

    if json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    } else {
        println!("Orchestrator:           {}", metrics.orchestrator_status);
        println!("Active tests:           {}", metrics.active_tests);
        println!("Queued tests:           {}", metrics.queued_tests);
        println!("Available environments: {}", metrics.available_environments);
    }
    Ok(())
}

fn cleanup(config_path: &Path, max_age_hours: u64) -> Result<()> {
    let (store, _) = open_store(config_path)?;
    let cutoff = i64::try_from(max_age_hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .and_then(|age| chrono::Utc::now().checked_sub_signed(age))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
    let summary = store.purge_terminal_older_than(cutoff)?;
    println!(
        "Removed {} records and {} plans older than {}h",
        summary.records, summary.plans, max_age_hours
    );
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Max concurrent:   {}", config.dispatch.max_concurrent);
            println!("  Max environments: {}", config.pool.max_environments);
            println!("  Parallelism:      {}", config.effective_parallelism());
            println!("  Catalog:          {} templates", config.pool.catalog.len());

            let provider_name = match &config.provider {
                ProviderConfig::Local(_) => "local",
                ProviderConfig::Command(_) => "command",
            };
            println!("  Provider:         {}", provider_name);

            let store = match &config.store {
                StoreConfig::Memory => "memory".to_string(),
                StoreConfig::Json { path } => format!("json ({})", path),
            };
            println!("  Store:            {}", store);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(provider: &str) -> Result<()> {
    let provider_config = match provider {
        "local" => {
            r#"[provider]
type = "local"
shell = "/bin/sh""#
        }
        "command" => {
            r#"[provider]
type = "command"
# Prints the new environment id as its last line
create_command = "./scripts/vm-create.sh --arch {arch} --mem {memory_mb} --name {name}"
exec_command = "./scripts/vm-exec.sh {env_id} {command}"
destroy_command = "./scripts/vm-destroy.sh {env_id}"
health_command = "./scripts/vm-exec.sh {env_id} true""#
        }
        _ => {
            eprintln!("Unknown provider: {}. Use: local, command", provider);
            std::process::exit(1);
        }
    };

    let config = format!(
        r#"# kdispatch configuration file

[dispatch]
max_concurrent = 8
poll_interval_ms = 2000
cancel_grace_secs = 30

[pool]
max_environments = 4

[[pool.catalog]]
name = "qemu-aarch64"
prewarm = 0
profile = {{ architecture = "aarch64", memory_mb = 2048, emulator = "qemu" }}

[[pool.catalog]]
name = "qemu-x86_64"
prewarm = 0
profile = {{ architecture = "x86_64", memory_mb = 2048, emulator = "qemu" }}

{}

[store]
type = "json"
path = ".kdispatch"

[report]
output_dir = "test-results"
junit = true
"#,
        provider_config
    );

    let path = PathBuf::from("kdispatch.toml");
    if path.exists() {
        eprintln!("kdispatch.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, config)?;
    println!("Created kdispatch.toml");
    println!();
    println!("Write a plan file, then run:");
    println!("  kdispatch run plan.toml");

    Ok(())
}
