//! debughost - developer-workstation container supervisor

use clap::{Parser, Subcommand};
use debughost_config::GlobalConfig;
use debughost_core::{
    LogFilter, ProjectFilter, ProjectManager, ProjectStatus, StartOptions, StopOptions,
    WorkspaceScanner,
};
use debughost_provider::connect_engine;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "debughost")]
#[command(author, version, about = "Container Supervisor for Dev Workstations", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor until interrupted
    Serve,

    /// Scan a workspace directory and print the ranked tech detections
    Scan {
        /// Absolute path of the workspace
        path: String,
    },

    /// Register a workspace as a project
    Register {
        /// Absolute path of the workspace
        path: String,
        /// Project name (defaults to the manifest or directory name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Start a project's container
    Start {
        /// Project ID
        project: String,
        /// Preferred host port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Stop a project's container
    Stop {
        /// Project ID
        project: String,
        /// Remove immediately instead of stopping gracefully
        #[arg(short, long)]
        force: bool,
    },

    /// Restart a project's container
    Restart {
        /// Project ID
        project: String,
    },

    /// Show a project's reconciled status
    Status {
        /// Project ID
        project: String,
    },

    /// List registered projects
    List {
        /// Only projects with this status
        #[arg(long)]
        status: Option<String>,
        /// Only projects with this primary tech
        #[arg(long)]
        tech: Option<String>,
    },

    /// Print buffered logs for a project
    Logs {
        /// Project ID
        project: String,
        /// Only the most recent N entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Remove a stopped or errored project
    Rm {
        /// Project ID
        project: String,
    },

    /// Remove every project in a terminal state
    ClearInactive,

    /// Show port range occupancy for a tech
    Ports {
        /// Tech label (nodejs, python, php, static, ...)
        tech: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GlobalConfig::load()?;

    // Scanning is pure filesystem inspection; it works with no engine
    if let Commands::Scan { path } = &cli.command {
        let scanner = WorkspaceScanner::new(config.stacks.clone());
        let result = scanner.scan(std::path::Path::new(path))?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let engine = connect_engine(&config).await?;
    let manager = ProjectManager::new(engine, config).await?;

    run_command(cli.command, manager).await
}

async fn run_command(command: Commands, manager: Arc<ProjectManager>) -> anyhow::Result<()> {
    match command {
        Commands::Serve => {
            tracing::info!("supervisor running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            manager.shutdown().await;
        }

        Commands::Scan { .. } => unreachable!("scan is handled before the engine connects"),

        Commands::Register { path, name } => {
            let project = manager.register(path, name).await?;
            println!("{} {}", project.project_id, project.name);
        }

        Commands::Start { project, port } => {
            let outcome = manager
                .start(
                    &project,
                    StartOptions {
                        preferred_port: port,
                        ..Default::default()
                    },
                )
                .await?;
            println!(
                "{} running at {} ({} ms)",
                outcome.container_name, outcome.access_url, outcome.elapsed_ms
            );
        }

        Commands::Stop { project, force } => {
            let outcome = manager
                .stop(
                    &project,
                    StopOptions {
                        force,
                        ..Default::default()
                    },
                )
                .await?;
            println!("stopped ({} ms)", outcome.elapsed_ms);
        }

        Commands::Restart { project } => {
            let outcome = manager.restart(&project, StartOptions::default()).await?;
            println!(
                "{} running at {} ({} ms)",
                outcome.container_name, outcome.access_url, outcome.elapsed_ms
            );
        }

        Commands::Status { project } => {
            let report = manager.status(&project).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::List { status, tech } => {
            let status = status
                .map(|s| parse_status(&s))
                .transpose()
                .map_err(|e| anyhow::anyhow!(e))?;
            let projects = manager.list(&ProjectFilter { status, tech }).await;
            for p in projects {
                println!(
                    "{}  {:<12} {:<10} {}",
                    p.short_id(),
                    p.name,
                    p.status,
                    p.workspace_path.display()
                );
            }
        }

        Commands::Logs { project, limit } => {
            let entries = manager
                .logs(
                    &project,
                    &LogFilter {
                        limit,
                        ..Default::default()
                    },
                )
                .await?;
            for entry in entries {
                println!("[{}] {} {}", entry.stream, entry.level, entry.message);
            }
        }

        Commands::Rm { project } => {
            let removed = manager.remove(&project).await?;
            println!("removed {}", removed.name);
        }

        Commands::ClearInactive => {
            let removed = manager.clear_inactive().await;
            println!("removed {} project(s)", removed.len());
        }

        Commands::Ports { tech } => {
            let usage = manager.port_usage(&tech);
            println!(
                "{}: {} allocated, {} free of {}",
                tech, usage.allocated, usage.free, usage.total
            );
        }
    }

    Ok(())
}

fn parse_status(s: &str) -> Result<ProjectStatus, String> {
    match s {
        "stopped" => Ok(ProjectStatus::Stopped),
        "starting" => Ok(ProjectStatus::Starting),
        "running" => Ok(ProjectStatus::Running),
        "stopping" => Ok(ProjectStatus::Stopping),
        "restarting" => Ok(ProjectStatus::Restarting),
        "error" => Ok(ProjectStatus::Error),
        other => Err(format!("unknown status: {}", other)),
    }
}
