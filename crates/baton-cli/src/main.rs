mod serve_cmd;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use baton_core::{AgentConfig, Dispatcher};

#[derive(Parser)]
#[command(name = "baton", about = "Per-project autonomous coding agent dispatcher")]
struct Cli {
    /// Project root (overrides BATON_PROJECT_DIR env var; defaults to the
    /// current directory)
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Path to an explicit config file, overriding agent.yaml/config.yaml
    /// discovery in the project root
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP façade and run the dispatcher until interrupted
    Serve {
        /// Address to bind the HTTP façade to
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to bind the HTTP façade to
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Start the scheduler loop immediately instead of waiting for a
        /// POST to /agent/dispatcher/start
        #[arg(long)]
        autostart: bool,
    },
    /// Write a default agent.yaml in the project root
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

fn resolve_project_dir(cli: &Cli) -> anyhow::Result<PathBuf> {
    if let Some(dir) = &cli.project_dir {
        return Ok(dir.clone());
    }
    if let Ok(dir) = std::env::var("BATON_PROJECT_DIR") {
        return Ok(PathBuf::from(dir));
    }
    std::env::current_dir().context("failed to determine current directory")
}

/// Write a default `agent.yaml` to `project_dir`, refusing to overwrite an
/// existing file unless `force` is set.
fn cmd_init(project_dir: &Path, force: bool) -> anyhow::Result<()> {
    let path = project_dir.join("agent.yaml");

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let yaml = serde_yaml::to_string(&AgentConfig::default()).context("failed to render default config")?;
    std::fs::write(&path, yaml).with_context(|| format!("failed to write {}", path.display()))?;

    println!("Config written to {}", path.display());
    println!("Next: run `baton serve` from the project root.");
    Ok(())
}

async fn cmd_serve(project_dir: PathBuf, explicit_config: Option<&Path>, bind: String, port: u16, autostart: bool) -> anyhow::Result<()> {
    let config = AgentConfig::load(&project_dir, explicit_config).context("failed to load configuration")?;
    let dispatcher = Dispatcher::new(project_dir, config).context("failed to open dispatcher")?;

    let lifecycle = Arc::new(dispatcher.lifecycle());
    if autostart {
        lifecycle.start().await;
    }

    let state = serve_cmd::AppState {
        store: Arc::clone(&dispatcher.store),
        worktrees: Arc::clone(&dispatcher.worktrees),
        lifecycle: Arc::clone(&lifecycle),
        data_dir: dispatcher.data_dir.clone(),
    };

    let result = serve_cmd::run_serve(state, &bind, port).await;

    lifecycle.stop().await;
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let project_dir = resolve_project_dir(&cli)?;

    match cli.command {
        Commands::Init { force } => cmd_init(&project_dir, force),
        Commands::Serve { bind, port, autostart } => {
            cmd_serve(project_dir, cli.config.as_deref(), bind, port, autostart).await
        }
    }
}
