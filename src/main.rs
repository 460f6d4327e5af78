use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use forge::forge_config::ForgeToml;
use forge::init::{FORGE_DIR, init_project};
use forge::planning_context::provider::{NullProvider, Provider};
use forge::registry::ProjectRegistry;
use forge::service::OrchestratorService;

#[derive(Parser)]
#[command(name = "forge")]
#[command(version, about = "Hierarchical multi-agent build orchestrator")]
pub struct Cli {
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new forge project directory (.forge/ + forge.toml).
    Init {
        #[arg(long)]
        from: Option<String>,
    },
    /// Start the orchestrator service: background analysis/execution/
    /// recovery loops plus the Dragon WebSocket and Wyvern delegation
    /// endpoints.
    Serve {
        /// Overrides `[orchestrator].bind` in forge.toml; falls back to
        /// 127.0.0.1:7625 if neither is set.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Manage projects tracked by the registry.
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Summarize every tracked project's status and execution state.
    Status,
}

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// Register a new project from a specification file.
    Create {
        name: String,
        workspace: PathBuf,
        #[arg(long)]
        spec_file: PathBuf,
    },
    /// List every tracked project.
    List,
    /// Show one project's full record.
    Show { id: Uuid },
    Pause { id: Uuid },
    Resume { id: Uuid },
    Suspend { id: Uuid },
    Cancel { id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init { from } => cmd_init(&project_dir, from.as_deref())?,
        Commands::Serve { bind } => cmd_serve(&project_dir, bind).await?,
        Commands::Project { command } => cmd_project(&project_dir, command).await?,
        Commands::Status => cmd_status(&project_dir).await?,
    }

    Ok(())
}

fn forge_dir_of(project_dir: &std::path::Path) -> PathBuf {
    project_dir.join(FORGE_DIR)
}

fn cmd_init(project_dir: &std::path::Path, from_pattern: Option<&str>) -> Result<()> {
    let result = init_project(project_dir, from_pattern)?;
    let toml_path = result.forge_dir.join("forge.toml");
    if !toml_path.exists() {
        ForgeToml::default().save(&toml_path)?;
    }

    if result.created {
        println!("Initialized forge project at {}", result.forge_dir.display());
    } else {
        println!("Forge project already initialized at {}", result.forge_dir.display());
    }
    println!("Run `forge project create <name> <workspace> --spec-file <path>` to register a project,");
    println!("then `forge serve` to start the orchestrator.");
    Ok(())
}

const DEFAULT_BIND: &str = "127.0.0.1:7625";

async fn cmd_serve(project_dir: &std::path::Path, bind_flag: &Option<String>) -> Result<()> {
    let forge_dir = forge_dir_of(project_dir);
    let config = ForgeToml::load_or_default(&forge_dir).unwrap_or_default();

    let bind = bind_flag
        .clone()
        .or(config.orchestrator.bind.clone())
        .unwrap_or_else(|| DEFAULT_BIND.to_string());

    let provider: Arc<dyn Provider> = Arc::new(NullProvider);
    let service = OrchestratorService::load_with_cadence(&forge_dir, provider, config.orchestrator.cadence).await?;

    let handles = service.spawn_background_loops();
    println!("orchestrator background loops started (pre-analysis/detailed-analysis/execution/stuck-worker/recovery)");

    let tracker = service.tracker.clone();
    let app = forge::service::server::router(service);
    let listener = tokio::net::TcpListener::bind(&bind).await.with_context(|| format!("failed to bind {bind}"))?;
    println!("listening on {bind} (ws: /ws, delegate: POST /delegate)");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.context("server exited")?;

    for handle in handles {
        handle.abort();
    }
    tracker.flush_all().await.context("failed to flush tracker state during shutdown")?;
    println!("orchestrator shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    println!("\nshutting down...");
}

async fn cmd_project(project_dir: &std::path::Path, command: &ProjectCommands) -> Result<()> {
    let forge_dir = forge_dir_of(project_dir);
    let registry = ProjectRegistry::load(&forge_dir).await?;

    match command {
        ProjectCommands::Create { name, workspace, spec_file } => {
            let specification = std::fs::read_to_string(spec_file)
                .with_context(|| format!("failed to read spec file {}", spec_file.display()))?;
            let project = registry.create(name, workspace.clone(), specification).await?;
            println!("created project {} ({})", project.id, project.name);
        }
        ProjectCommands::List => {
            for project in registry.list().await {
                println!("{}  {:<20}  {:?}  {:?}", project.id, project.name, project.status, project.execution_state);
            }
        }
        ProjectCommands::Show { id } => {
            let project = registry.get(*id).await?;
            println!("{project:#?}");
        }
        ProjectCommands::Pause { id } => {
            let project = registry.set_execution_state(*id, forge_common::ExecutionState::Paused).await?;
            println!("project {} is now {:?}", project.id, project.execution_state);
        }
        ProjectCommands::Resume { id } => {
            let project = registry.set_execution_state(*id, forge_common::ExecutionState::Running).await?;
            println!("project {} is now {:?}", project.id, project.execution_state);
        }
        ProjectCommands::Suspend { id } => {
            let project = registry.set_execution_state(*id, forge_common::ExecutionState::Suspended).await?;
            println!("project {} is now {:?}", project.id, project.execution_state);
        }
        ProjectCommands::Cancel { id } => {
            let project = registry.set_execution_state(*id, forge_common::ExecutionState::Cancelled).await?;
            println!("project {} is now {:?}", project.id, project.execution_state);
        }
    }
    Ok(())
}

async fn cmd_status(project_dir: &std::path::Path) -> Result<()> {
    let forge_dir = forge_dir_of(project_dir);
    if !forge_dir.exists() {
        println!("Project not initialized. Run `forge init` first.");
        return Ok(());
    }

    let registry = ProjectRegistry::load(&forge_dir).await?;
    let projects = registry.list().await;
    if projects.is_empty() {
        println!("No projects registered yet.");
        return Ok(());
    }

    println!("{:<36}  {:<20}  {:<14}  {:<10}  LAST ERROR", "ID", "NAME", "STATUS", "EXECUTION");
    for project in projects {
        println!(
            "{:<36}  {:<20}  {:<14?}  {:<10?}  {}",
            project.id,
            project.name,
            project.status,
            project.execution_state,
            project.last_error.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
