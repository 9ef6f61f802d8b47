//! bundlectl
//!
//! Command-line access to bundled dataset directories: migrate them,
//! publish and pull changes, and manage device locks.

mod cli;
mod commands;
mod context;
mod error;
mod logging;

use clap::Parser;
use colored::Colorize;

use cli::{Cli, Commands};
use context::Context;
use error::Result;

fn main() {
    if let Err(e) = run() {
        eprintln!("{}: {}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.verbose) {
        eprintln!("{}: could not set up logging: {}", "warning".yellow().bold(), e);
    }
    tracing::debug!(target_dir = %cli.target.display(), kind = ?cli.kind, "Starting");

    let Some(command) = cli.command.clone() else {
        println!("{} bundled dataset tool", "bundlectl".green().bold());
        println!();
        println!("Run {} for available commands.", "bundlectl --help".cyan());
        return Ok(());
    };

    let ctx = Context::from_cli(&cli)?;
    execute_command(&ctx, command)
}

fn execute_command(ctx: &Context, cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Status { json } => commands::run_status(ctx, json),
        Commands::Update => commands::run_update(ctx),
        Commands::Flush => commands::run_flush(ctx),
        Commands::Migrate => commands::run_migrate(ctx),
        Commands::Unmigrate => commands::run_unmigrate(ctx),
        Commands::Locks => commands::run_locks(ctx),
        Commands::IgnoreLock { lock_device } => commands::run_ignore_lock(ctx, &lock_device),
    }
}
