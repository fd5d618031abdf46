//! `rcg` entry point.
//!
//! This file is intentionally thin: parse arguments, load and validate the
//! layered configuration, build the orchestrator, dispatch one subcommand.
//!
//! Exit codes: 0 success, 1 fatal init/runtime error, 2 invalid
//! configuration.

use anyhow::Result;
use clap::{Parser, Subcommand};

use rcg_config::ConfigError;
use rcg_runtime::Orchestrator;
use rcg_schemas::ServiceType;

#[derive(Parser)]
#[command(name = "rcg")]
#[command(about = "Scheduled prepaid-airtime recharge engine", long_about = None)]
struct Cli {
    /// Layered config paths in merge order (base -> env -> overrides).
    #[arg(long = "config", required = true)]
    config_paths: Vec<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the orchestrator and stay resident until SIGINT/SIGTERM.
    Start,

    /// Run one service's pipeline immediately, bypassing the scheduler.
    RunOnce {
        /// GPS | VOZ | ELIOT
        service: String,
    },

    /// Print queue stats, lock state, and registered schedules.
    Status,

    /// Sweep expired locks; --force removes every lock.
    CleanLocks {
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    // Dev convenience; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    let (app, loaded) = match rcg_config::load_app_config(
        &cli.config_paths.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
    ) {
        Ok(v) => v,
        Err(e) => {
            if let Some(ConfigError::Invalid { violations }) = e.downcast_ref::<ConfigError>() {
                eprintln!("invalid configuration:");
                for v in violations {
                    eprintln!("  - {v}");
                }
                std::process::exit(2);
            }
            eprintln!("config load failed: {e:#}");
            std::process::exit(2);
        }
    };
    tracing::info!(config_hash = %loaded.config_hash, "configuration loaded");

    let runtime = tokio::runtime::Runtime::new().expect("build tokio runtime");
    if let Err(e) = runtime.block_on(run(cli.cmd, app)) {
        eprintln!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cmd: Commands, app: rcg_config::AppConfig) -> Result<()> {
    let orchestrator = Orchestrator::build(&app).await?;

    match cmd {
        Commands::Start => orchestrator.start().await?,

        Commands::RunOnce { service } => {
            let service = ServiceType::parse(&service)?;
            let report = orchestrator.run_service_once(service).await?;
            println!("service={}", report.service);
            println!("outcome={:?}", report.outcome);
            println!(
                "candidates={} to_recharge={} savings={} reporting_on_time={}",
                report.candidates, report.to_recharge, report.savings, report.reporting_on_time
            );
            println!(
                "dispatched={} ws_failures={} pending_db={}",
                report.dispatched,
                report.ws_failures,
                report.queue_stats.pending_db()
            );
            for b in &report.batches {
                println!(
                    "batch master_id={} inserted={} duplicates={} total={} provider={} recovery={}",
                    b.master_id, b.inserted, b.duplicates, b.total_amount, b.provider, b.is_recovery
                );
            }
        }

        Commands::Status => {
            let status = orchestrator.status().await?;
            for (svc, q) in &status.queues {
                println!(
                    "queue {svc}: pending={} inserted={} duplicate={} failed={} total={} pending_db={}",
                    q.pending,
                    q.inserted,
                    q.duplicate,
                    q.failed,
                    q.total,
                    q.pending_db()
                );
            }
            for lock in &status.locks {
                println!(
                    "lock {}: holder={} pid={} acquired_at={} expires_at={}",
                    lock.key, lock.holder_id, lock.pid, lock.acquired_at_unix, lock.expires_at_unix
                );
            }
            for (svc, desc) in &status.schedules {
                println!("schedule {svc}: {desc}");
            }
            println!("recharges_today={}", status.recharges_today);
        }

        Commands::CleanLocks { force } => {
            let removed = orchestrator.clean_locks(force).await?;
            println!("locks_removed={removed} force={force}");
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
