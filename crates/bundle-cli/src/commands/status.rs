//! Status command implementation

use std::collections::BTreeMap;

use bundle_core::{
    BundleId, BundlePath, DeviceLock, HeadRefs, HeadRefsPropertiesFile, published_head_refs,
};
use colored::Colorize;
use serde_json::json;

use crate::context::Context;
use crate::error::Result;

/// Run the status command
pub fn run_status(ctx: &Context, json: bool) -> Result<()> {
    let mode = ctx.bundle_mode()?;
    let published = published_head_refs(&ctx.target, ctx.kind)?.heads()?;
    let working = HeadRefsPropertiesFile::new(
        ctx.working
            .join(BundlePath::MetadataDir)
            .join(BundlePath::HeadsFile),
    )
    .heads()?;
    let locks = ctx.device_locks()?.conflicting_locks()?;

    if json {
        let output = json!({
            "target": ctx.target.display().to_string(),
            "working": ctx.working.display().to_string(),
            "kind": ctx.kind,
            "mode": mode.map(|m| m.as_str()),
            "published": head_tokens(&published),
            "working_heads": head_tokens(&working),
            "locks": locks.iter().map(|l| json!({
                "device": l.device_id,
                "owner": l.owner,
                "username": l.username,
                "host": l.host,
                "opened": l.opened.to_rfc3339(),
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}", "Bundle Status".bold());
    println!();
    println!("{}:   {}", "Target".dimmed(), ctx.target.display());
    if !ctx.is_in_place() {
        println!("{}:  {}", "Working".dimmed(), ctx.working.display());
    }
    println!("{}:     {:?}", "Kind".dimmed(), ctx.kind);
    match mode {
        Some(mode) => println!("{}:     {}", "Mode".dimmed(), mode.as_str().cyan()),
        None => println!("{}:     {}", "Mode".dimmed(), "flat".yellow()),
    }
    println!();

    println!("{}:", "Published Heads".bold());
    if published.is_empty() {
        println!("  {}", "None".dimmed());
    }
    for (name, id) in &published {
        let marker = match working.get(name) {
            Some(synced) if synced == id => "in sync".green(),
            Some(_) => "behind".yellow(),
            None => "not synced".dimmed(),
        };
        println!("  {} {} ({})", name.cyan(), id, marker);
    }
    println!();

    print_locks(&locks);
    Ok(())
}

/// Print lock files of other devices, or nothing when there are none.
pub fn print_locks(locks: &[DeviceLock]) {
    if locks.is_empty() {
        return;
    }
    println!("{}:", "Open On Other Devices".bold());
    for lock in locks {
        println!(
            "  {} {} by {}@{} since {}",
            "!".yellow(),
            lock.device_id.cyan(),
            lock.username,
            lock.host,
            lock.opened.format("%Y-%m-%d %H:%M"),
        );
    }
    println!();
}

fn head_tokens(heads: &BTreeMap<String, BundleId>) -> BTreeMap<&str, String> {
    heads
        .iter()
        .map(|(name, id)| (name.as_str(), id.to_string()))
        .collect()
}
