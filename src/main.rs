use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use pipeloom::config::Config;
use pipeloom::host::HttpHostClient;
use pipeloom::orchestrator::Orchestrator;
use pipeloom::pipeline_config::PipelineConfig;

#[derive(Parser)]
#[command(name = "pipeloom")]
#[command(version, about = "Poll-driven orchestrator for multi-agent pipelines over a Host issue tracker")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "pipeloom.toml")]
    pub config: PathBuf,

    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the poll loop until interrupted.
    Run,
    /// Execute a single tick and exit.
    Once,
    /// Print tracked pipelines (requires a prior `run`/`once` to have left state; this
    /// reconstructs a fresh snapshot from the Host instead).
    Status,
    /// View or validate the pipeline configuration document.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Validate the configuration file and report any errors.
    Validate,
    /// Print the parsed configuration.
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let dir = log_dir(&cli);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    let _guard = init_logging(cli.verbose, &dir);

    match &cli.command {
        Commands::Run => cmd_run(&cli).await,
        Commands::Once => cmd_once(&cli).await,
        Commands::Status => cmd_status(&cli).await,
        Commands::Config { command } => cmd_config(&cli, command.clone()),
    }
}

/// Installs a stdout layer plus a daily-rolling file layer under
/// `log_dir`. The returned guard must stay alive for the process
/// lifetime — dropping it stops the non-blocking file writer.
fn init_logging(verbose: bool, log_dir: &Path) -> WorkerGuard {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "pipeloom.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_target(false))
        .with(fmt::layer().with_target(false).with_ansi(false).with_writer(non_blocking))
        .init();

    guard
}

fn log_dir(cli: &Cli) -> PathBuf {
    cli.log_dir.clone().unwrap_or_else(|| PathBuf::from(".pipeloom/logs"))
}

fn load_config(cli: &Cli) -> Result<Config> {
    Config::load(cli.config.clone(), log_dir(cli), cli.verbose)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))
}

async fn cmd_run(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    config.ensure_directories()?;
    let host = Arc::new(HttpHostClient::new(config.host_base_url.clone(), config.host_token.clone())?);
    let mut orchestrator = Orchestrator::new(host, config.pipeline);

    let (stop_flag, notify) = orchestrator.stop_handle();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        stop_flag.store(true, std::sync::atomic::Ordering::SeqCst);
        notify.notify_one();
    });

    orchestrator.run().await;
    Ok(())
}

async fn cmd_once(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    config.ensure_directories()?;
    let host = Arc::new(HttpHostClient::new(config.host_base_url.clone(), config.host_token.clone())?);
    let mut orchestrator = Orchestrator::new(host, config.pipeline);
    orchestrator.tick().await;
    pipeloom::ui::print_poll_state(&orchestrator.state());
    Ok(())
}

async fn cmd_status(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let host = Arc::new(HttpHostClient::new(config.host_base_url.clone(), config.host_token.clone())?);
    let mut orchestrator = Orchestrator::new(host, config.pipeline);
    orchestrator.tick().await;
    pipeloom::ui::print_poll_state(&orchestrator.state());
    pipeloom::ui::print_store(orchestrator.store());
    Ok(())
}

fn cmd_config(cli: &Cli, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate => match PipelineConfig::load(&cli.config) {
            Ok(_) => {
                println!("{} is valid", cli.config.display());
                Ok(())
            }
            Err(e) => anyhow::bail!("{} is invalid: {e}", cli.config.display()),
        },
        ConfigCommands::Show => {
            let config = PipelineConfig::load(&cli.config)?;
            println!("project = {:?}", config.project);
            println!("poll_interval_secs = {}", config.poll_interval_secs);
            println!("assignment_grace_secs = {}", config.assignment_grace_secs);
            println!("recovery_cooldown_secs = {}", config.recovery_cooldown_secs);
            println!("review_status = {:?}", config.review_status);
            for status in &config.statuses {
                println!("[[statuses]] {} -> {:?}", status.name, status.agents);
            }
            Ok(())
        }
    }
}
