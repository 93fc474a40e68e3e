// ABOUTME: Entry point for the siteaudit command line tool
// ABOUTME: Loads .env, installs logging and dispatches subcommands

use clap::{Parser, Subcommand};
use colored::*;
use std::process;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::config::ConfigArgs;
use cli::run::RunArgs;

#[derive(Parser)]
#[command(name = "siteaudit")]
#[command(about = "siteaudit - run website audits inside disposable remote sandboxes")]
#[command(version)]
struct Cli {
    /// Show debug logs and live command output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Audit a local project (or a public URL) in a fresh sandbox
    Run(RunArgs),
    /// Show the resolved configuration for a project
    Config(ConfigArgs),
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Run(args) => cli::run::execute(args, cli.verbose).await,
        Commands::Config(args) => cli::config::execute(args).await,
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(cli::exit_code(&e));
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "info,siteaudit=debug,siteaudit_sandbox=debug"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .compact()
        .init();
}
