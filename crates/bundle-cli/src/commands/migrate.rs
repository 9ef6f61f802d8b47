//! Migrate and unmigrate command implementations

use bundle_core::{BundleMode, migrate, unmigrate};
use colored::Colorize;

use crate::context::Context;
use crate::error::{CliError, Result};

/// Run the migrate command
pub fn run_migrate(ctx: &Context) -> Result<()> {
    check_in_place(ctx)?;
    if migrate(&ctx.target, ctx.kind, BundleMode::Local, &ctx.settings)? {
        println!("{} {}", "Bundled".green().bold(), ctx.target.display());
    } else {
        println!("{} is already bundled", ctx.target.display());
    }
    Ok(())
}

/// Run the unmigrate command
pub fn run_unmigrate(ctx: &Context) -> Result<()> {
    check_in_place(ctx)?;
    if unmigrate(&ctx.target, ctx.kind, &ctx.settings)? {
        println!("{} {}", "Unbundled".green().bold(), ctx.target.display());
    } else {
        println!("{} is not bundled", ctx.target.display());
    }
    Ok(())
}

fn check_in_place(ctx: &Context) -> Result<()> {
    if ctx.is_in_place() {
        Ok(())
    } else {
        Err(CliError::user(
            "migration works on the target directory in place; drop --working",
        ))
    }
}
