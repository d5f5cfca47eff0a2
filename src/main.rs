//! drover - multi-process account job orchestrator
//!
//! `drover run` supervises the worker pool; `drover worker` is the hidden
//! entrypoint each worker process is started with.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};

use drover::classify::PatternClassifier;
use drover::config::{DroverConfig, DEFAULT_CONFIG_FILE};
use drover::interfaces::JobSource;
use drover::ledger::JobLedger;
use drover::notify::{ConclusionFanOut, ReportFileSink, TracingAlertSink, TracingConclusionSink};
use drover::operations::{CommandExecutor, FileJobSource};
use drover::supervisor::{ProcessLauncher, ShutdownHandle, Supervisor};
use drover::worker::WorkerRuntime;
use drover::{DroverError, RunReport};

/// Exit code when every worker finished but at least one account was banned.
const EXIT_BANNED: i32 = 3;

#[derive(Parser)]
#[command(name = "drover")]
#[command(version)]
#[command(about = "Multi-process account job orchestrator", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file (missing file means defaults)
    #[arg(short, long, global = true, env = "DROVER_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit supervisor logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every job across the worker pool
    Run {
        /// Number of worker processes
        #[arg(short, long)]
        workers: Option<usize>,

        /// Job file (JSON array of accounts)
        #[arg(short, long)]
        jobs: Option<PathBuf>,

        /// Liveness file rewritten with a timestamp while running
        #[arg(long, env = "DROVER_HEARTBEAT_FILE")]
        heartbeat_file: Option<PathBuf>,
    },

    /// Serve one assignment over stdin/stdout (started by `run`)
    #[command(hide = true)]
    Worker,

    /// Inspect or prune the completion ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum LedgerAction {
    /// List recorded days
    Status,

    /// Delete day directories older than the retention window
    Prune {
        /// Days to keep (defaults to ledger.keep_days)
        #[arg(long)]
        keep_days: Option<u32>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate the configuration, executor and job file
    Check,

    /// Print the effective configuration as TOML
    Show,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Worker => run_worker(&cli.config, cli.verbose).await,
        command => {
            init_logging(cli.verbose, cli.log_json);
            dispatch(command, &cli).await
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            let code = e
                .downcast_ref::<DroverError>()
                .map_or(1, DroverError::exit_code);
            std::process::exit(code);
        }
    }
}

fn env_filter(verbose: bool) -> tracing_subscriber::EnvFilter {
    let default = if verbose {
        "drover=debug,info"
    } else {
        "drover=info,warn"
    };
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default))
}

fn init_logging(verbose: bool, json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn dispatch(command: &Commands, cli: &Cli) -> anyhow::Result<i32> {
    let mut config = DroverConfig::load(&cli.config)?;

    match command {
        Commands::Run {
            workers,
            jobs,
            heartbeat_file,
        } => {
            if let Some(workers) = workers {
                config.supervisor.workers = *workers;
            }
            if let Some(jobs) = jobs {
                config.jobs_file = jobs.clone();
            }
            if heartbeat_file.is_some() {
                config.supervisor.heartbeat_file = heartbeat_file.clone();
            }
            run_supervisor(config, &cli.config, cli.verbose).await
        }
        Commands::Ledger { action } => {
            let ledger = JobLedger::new(&config.ledger.dir);
            match action {
                LedgerAction::Status => ledger_status(&ledger),
                LedgerAction::Prune { keep_days } => {
                    let keep_days = keep_days.unwrap_or(config.ledger.keep_days);
                    let removed = ledger.prune(keep_days, chrono::Local::now().date_naive())?;
                    println!(
                        "{} Removed {} day(s) older than {} day(s)",
                        "✓".green().bold(),
                        removed.len(),
                        keep_days
                    );
                    Ok(0)
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Check => Ok(config_check(&config)),
            ConfigAction::Show => {
                let rendered =
                    toml::to_string_pretty(&config).context("Failed to render configuration")?;
                print!("{rendered}");
                Ok(0)
            }
        },
        Commands::Worker => run_worker(&cli.config, cli.verbose).await,
    }
}

async fn run_supervisor(
    config: DroverConfig,
    config_path: &Path,
    verbose: bool,
) -> anyhow::Result<i32> {
    config.validate()?;

    let jobs = FileJobSource::new(&config.jobs_file)
        .load_jobs()
        .map_err(|e| DroverError::JobLoad {
            message: format!("{e:#}"),
        })?;
    info!(
        "Loaded {} job(s) from {}",
        jobs.len(),
        config.jobs_file.display()
    );

    let mut worker_args = vec![
        "worker".to_string(),
        "--config".to_string(),
        config_path.display().to_string(),
    ];
    if verbose {
        worker_args.push("--verbose".to_string());
    }
    let launcher = ProcessLauncher::current_exe(worker_args)?;

    let mut conclusion = ConclusionFanOut::new().with(TracingConclusionSink);
    if let Some(dir) = &config.supervisor.report_dir {
        conclusion = conclusion.with(ReportFileSink::new(dir));
    }

    let supervisor = Supervisor::new(
        config.supervisor.clone(),
        Arc::new(launcher),
        Arc::new(conclusion),
    );
    tokio::spawn(relay_signals(supervisor.shutdown_handle()));

    let report = supervisor.run(jobs).await?;
    report.print_summary();
    Ok(exit_code(&report))
}

fn exit_code(report: &RunReport) -> i32 {
    if !report.failed_workers.is_empty() {
        1
    } else if !report.banned_jobs().is_empty() {
        EXIT_BANNED
    } else {
        0
    }
}

/// Turn SIGINT/SIGTERM into a relayed shutdown.
async fn relay_signals(handle: ShutdownHandle) {
    loop {
        if let Err(e) = wait_for_signal().await {
            warn!("Signal handling unavailable: {}", e);
            return;
        }
        if handle.is_triggered() {
            warn!("Shutdown already in progress, waiting for workers to finish their current job");
        } else {
            handle.trigger();
        }
    }
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }

    Ok(())
}

async fn run_worker(config_path: &Path, verbose: bool) -> anyhow::Result<i32> {
    let config = DroverConfig::load(config_path)?;
    let classifier = PatternClassifier::new(&config.classifier)?;

    let runtime = WorkerRuntime::new(
        config.pipeline.clone(),
        Arc::new(CommandExecutor::new(config.executor.clone())),
        Arc::new(classifier),
        Arc::new(TracingAlertSink),
        JobLedger::new(&config.ledger.dir),
    )
    .with_throttle(config.throttle)
    .with_hold_on_standby(config.worker.hold_on_standby);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_target(false)
        .with_ansi(false)
        .without_time()
        .with_writer(runtime.log_forwarder())
        .init();

    // Terminal signals reach the whole process group; only the supervisor
    // decides when a worker stops.
    tokio::spawn(async {
        while wait_for_signal().await.is_ok() {
            info!("Signal ignored, waiting for the supervisor");
        }
    });

    Ok(runtime.run(tokio::io::stdin(), tokio::io::stdout()).await)
}

fn ledger_status(ledger: &JobLedger) -> anyhow::Result<i32> {
    let days = ledger.days()?;
    println!("Ledger: {}", ledger.dir().display());
    if days.is_empty() {
        println!("  {}", "no recorded days".dimmed());
        return Ok(0);
    }
    for day in days {
        let key = JobLedger::date_key(day);
        let accounts = std::fs::read_dir(ledger.dir().join(&key))
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                    .count()
            })
            .unwrap_or(0);
        println!("  {}  {} account(s)", key, accounts);
    }
    Ok(0)
}

fn config_check(config: &DroverConfig) -> i32 {
    let mut ok = true;
    let mut report = |passed: bool, label: &str, detail: String| {
        ok &= passed;
        let mark = if passed { "✓".green() } else { "✗".red() };
        println!("  {} {:<10} {}", mark, label, detail);
    };

    println!("{}", "Configuration check".bold());
    match config.validate() {
        Ok(()) => report(true, "config", "valid".into()),
        Err(e) => report(false, "config", e.to_string()),
    }

    if config.executor.command.is_empty() {
        report(false, "executor", "executor.command is not set".into());
    } else {
        match which::which(&config.executor.command) {
            Ok(path) => report(true, "executor", path.display().to_string()),
            Err(_) => report(
                false,
                "executor",
                format!("{} not found", config.executor.command),
            ),
        }
    }

    match FileJobSource::new(&config.jobs_file).load_jobs() {
        Ok(jobs) => report(
            true,
            "jobs",
            format!("{} job(s) in {}", jobs.len(), config.jobs_file.display()),
        ),
        Err(e) => report(false, "jobs", format!("{e:#}")),
    }

    if ok {
        0
    } else {
        1
    }
}
