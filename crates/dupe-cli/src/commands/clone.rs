use anyhow::Result;
use clap::Args;
use colored::Colorize;

use dupe_core::config::DupeConfig;
use dupe_core::operation::OperationRequest;

use crate::cli::Verbosity;

/// Arguments for the `clone` command
#[derive(Args, Debug)]
pub struct CloneArgs {
    /// Source disk (e.g. /dev/disk2) or disk image file to restore from
    pub source: String,

    /// Target disk. Everything on it is erased.
    pub target: String,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

/// Restore a disk or image onto a target disk
pub async fn run(config: &DupeConfig, args: CloneArgs, verbosity: Verbosity) -> Result<()> {
    let request = OperationRequest::clone_disk(&args.source, &args.target);
    request.validate()?;

    if !args.yes {
        print!(
            "\n{} All data on {} will be erased. Clone {} onto it? [y/N] ",
            "CONFIRM:".yellow(),
            args.target.bold(),
            args.source.bold()
        );
        std::io::Write::flush(&mut std::io::stdout())?;

        let mut input = String::new();
        std::io::BufRead::read_line(&mut std::io::stdin().lock(), &mut input)?;
        if !is_confirmation(&input) {
            println!("{}", "Aborted.".yellow());
            return Ok(());
        }
    }

    super::run_operation(config, request, verbosity).await
}

fn is_confirmation(input: &str) -> bool {
    let input = input.trim().to_lowercase();
    input == "y" || input == "yes"
}
