use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use dupe_core::config::DupeConfig;
use dupe_core::inventory::{DiskInfo, DiskInventory};

/// Arguments for the `list` command
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Include EFI, recovery and other system-reserved volumes
    #[arg(short, long)]
    pub all: bool,
}

/// List disks and partitions
pub async fn run(config: &DupeConfig, args: ListArgs) -> Result<()> {
    let disks = DiskInventory::new(&config.tools.diskutil)
        .include_reserved(args.all)
        .list()
        .await
        .context("failed to list disks")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&disks)?);
        return Ok(());
    }

    if disks.is_empty() {
        println!("{}", "No disks found.".yellow());
        return Ok(());
    }

    for line in format_table(&disks) {
        println!("{line}");
    }
    Ok(())
}

/// One aligned row per disk: device, size, content, name.
fn format_table(disks: &[DiskInfo]) -> Vec<String> {
    let dev_width = disks
        .iter()
        .map(|d| d.device_identifier.len())
        .max()
        .unwrap_or(0);
    let size_width = disks.iter().map(|d| d.size.len()).max().unwrap_or(0);
    let content_width = disks.iter().map(|d| d.content.len()).max().unwrap_or(0);

    disks
        .iter()
        .map(|d| {
            format!(
                "{:<dev_width$}  {:>size_width$}  {:<content_width$}  {}",
                d.device_identifier.cyan(),
                d.size,
                d.content.dimmed(),
                d.name.bold(),
            )
        })
        .collect()
}
