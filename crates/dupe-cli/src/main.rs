mod cli;
mod commands;
mod logging;
mod render;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands, Verbosity};
use colored::Colorize;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbosity = cli.verbosity();

    // `completion` needs neither logging nor configuration
    if let Commands::Completion(args) = &cli.command {
        clap_complete::generate(
            args.shell,
            &mut <Cli as clap::CommandFactory>::command(),
            "dupe",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    let log_guard = match logging::init(cli.log_dir.as_deref()) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("{} logging disabled: {:#}", "WARNING:".yellow().bold(), e);
            None
        }
    };
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "dupe starting");

    let config = match commands::load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {:#}", "ERROR".red().bold(), e);
            drop(log_guard);
            std::process::exit(1);
        }
    };

    if verbosity == Verbosity::Verbose {
        println!(
            "{} elevation: {}, logs: {}",
            "DEBUG".dimmed(),
            config.elevation,
            cli.log_dir
                .clone()
                .unwrap_or_else(logging::default_log_dir)
                .display()
        );
    }

    let result = match cli.command {
        Commands::List(args) => commands::list::run(&config, args).await,
        Commands::Clone(args) => commands::clone::run(&config, args, verbosity).await,
        Commands::CreateImage(args) => {
            commands::create_image::run(&config, args, verbosity).await
        }
        Commands::Verify(args) => commands::verify::run(&config, args, verbosity).await,
        Commands::Completion(_) => unreachable!("completion handled above"),
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            let code = commands::exit_code(&e);
            if code == 130 {
                eprintln!("\n{}", "CANCELLED".yellow().bold());
            } else {
                eprintln!("\n{} {:#}", "FAILED".red().bold(), e);
            }
            tracing::error!(error = %format!("{e:#}"), code, "command failed");
            drop(log_guard);
            std::process::exit(code);
        }
    }
}
