//! Device lock command implementations

use colored::Colorize;

use super::status::print_locks;
use crate::context::Context;
use crate::error::{CliError, Result};

/// Run the locks command
pub fn run_locks(ctx: &Context) -> Result<()> {
    let locks = ctx.device_locks()?.conflicting_locks()?;
    if locks.is_empty() {
        println!("{}", "No other device has this directory open".dimmed());
    } else {
        print_locks(&locks);
    }
    Ok(())
}

/// Run the ignore-lock command
pub fn run_ignore_lock(ctx: &Context, device: &str) -> Result<()> {
    let manager = ctx.device_locks()?;
    let lock = manager
        .conflicting_locks()?
        .into_iter()
        .find(|l| l.device_id == device)
        .ok_or_else(|| CliError::user(format!("No recent lock from device '{device}'")))?;

    manager.ignore(&lock)?;
    println!("{} lock of {}", "Ignored".green().bold(), device.cyan());
    Ok(())
}
