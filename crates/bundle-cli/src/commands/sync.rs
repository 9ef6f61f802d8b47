//! Update and flush command implementations

use std::sync::Arc;

use bundle_core::LoggingLockHandler;
use colored::Colorize;

use super::status::print_locks;
use crate::context::{CLI_OWNER, Context};
use crate::error::Result;

/// Run the update command
pub fn run_update(ctx: &Context) -> Result<()> {
    // preparing the directory pulls every newer bundle
    let dir = ctx.open()?;
    let heads = dir.working_heads()?;
    println!(
        "{} {} ({} partitions)",
        "Updated".green().bold(),
        dir.working_dir().display(),
        heads.len()
    );
    Ok(())
}

/// Run the flush command
pub fn run_flush(ctx: &Context) -> Result<()> {
    let mut dir = ctx.open()?;
    print_locks(&ctx.device_locks()?.conflicting_locks()?);

    dir.acquire_write_lock(Arc::new(LoggingLockHandler), CLI_OWNER)?;
    let published = dir.flush_data();
    dir.release_write_lock();

    if published? {
        println!("{} {}", "Flushed".green().bold(), dir.working_dir().display());
    } else {
        println!(
            "{} changes could not be published yet; try again",
            "Pending".yellow().bold()
        );
    }
    Ok(())
}
