use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::process;

mod cli;

#[derive(Parser)]
#[command(name = "metrodeck")]
#[command(about = "Metrodeck - supervise Metro and Expo dev servers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for dev servers running outside metrodeck
    Discover,
    /// Check whether a directory is a React Native project and detect its type
    Check {
        /// Project root path
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Start a project's dev server and stream its logs until Ctrl-C
    Run {
        /// Project root path
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Port for the dev server (default 8081)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Keep the registry reconciled and print its events until Ctrl-C
    Watch,
    /// Free a port by terminating whatever listens on it
    KillPort {
        /// Port to free
        port: u16,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = handle_command(cli.command).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();
}

async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Discover => cli::discover::handle_discover_command().await,
        Commands::Check { path } => cli::projects::handle_check_command(&path),
        Commands::Run { path, port } => cli::run::handle_run_command(&path, port).await,
        Commands::Watch => cli::run::handle_watch_command().await,
        Commands::KillPort { port } => cli::discover::handle_kill_port_command(port).await,
    }
}
