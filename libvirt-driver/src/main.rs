//! libvirt-driver - Main entry point
//!
//! Runs backup and restore jobs of a libvirt domain against a local catalog.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use libvirt_driver::{
    config::Config,
    daemon::shutdown::ShutdownCoordinator,
    host::{Catalog, HostRunner, JobSummary},
    utils, JobSession, Level,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Plugin definition, e.g. "vmname=vm1:strictIncremental=true" (overrides config)
    #[arg(short = 'o', long, value_name = "DEFINITION")]
    options: Option<String>,

    /// Catalog directory (overrides config)
    #[arg(long, value_name = "DIR")]
    catalog: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up the configured VM
    Backup {
        /// Id of this job
        #[arg(long)]
        job_id: u32,

        /// full or incremental
        #[arg(long, default_value = "full")]
        level: Level,

        /// Request accurate mode (rejected by the driver)
        #[arg(long)]
        accurate: bool,
    },

    /// Restore the backup chain ending at a given job
    Restore {
        /// Id of this restore job
        #[arg(long)]
        job_id: u32,

        /// Backup job to restore
        #[arg(long)]
        from: u32,

        /// Directory the restored files are written below
        #[arg(long = "where", value_name = "DIR")]
        where_dir: PathBuf,
    },

    /// List jobs in the catalog
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(definition) = &args.options {
        config.plugin.merge_definition(definition)?;
    }
    if let Some(catalog) = &args.catalog {
        config.host.catalog_dir = catalog.clone();
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting libvirt-driver v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = ShutdownCoordinator::new();
    let cancel = shutdown.token();
    let command = args.command;

    let mut job = tokio::task::spawn_blocking(move || run(config, command, cancel));

    let summary = tokio::select! {
        result = &mut job => result.context("job task panicked")??,
        signal = shutdown.wait_for_signal() => {
            signal?;
            // The job notices the cancelled token between lifecycle calls
            // and tears down its subprocess before returning.
            let result = job.await.context("job task panicked")?;
            if let Err(e) = result {
                tracing::warn!("{}", e);
            }
            anyhow::bail!("job cancelled by signal");
        }
    };

    if let Some(summary) = summary {
        for item in &summary.items {
            println!("{}", item);
        }
        println!("job {}: {:?} ({} bytes)", summary.job_id, summary.outcome, summary.bytes);
        if !summary.succeeded() {
            std::process::exit(1);
        }
    }
    Ok(())
}

fn run(
    config: Config,
    command: Command,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<Option<JobSummary>> {
    let catalog = Catalog::open(&config.host.catalog_dir)?;
    let runner = HostRunner::with_cancel(&catalog, config.host.chunk_size, cancel);

    match command {
        Command::Backup { job_id, level, accurate } => {
            let session = JobSession::from_options(job_id, level, config.plugin)?;
            Ok(Some(runner.run_backup(session, accurate)?))
        }
        Command::Restore { job_id, from, where_dir } => {
            let session = JobSession::from_options(job_id, Level::Full, config.plugin)?;
            Ok(Some(runner.run_restore(session, from, &where_dir)?))
        }
        Command::List => {
            for job in catalog.jobs()? {
                println!(
                    "{:>10}  {:<11}  {:<12}  {:<9}  {:>12}  {}",
                    job.job_id,
                    job.level.to_string(),
                    job.vm_name,
                    format!("{:?}", job.status),
                    job.bytes,
                    job.finished_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(None)
        }
    }
}
