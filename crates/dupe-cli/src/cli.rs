use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;

use dupe_core::elevation::ElevationMethod;

use crate::commands::{
    clone::CloneArgs, create_image::CreateImageArgs, list::ListArgs, verify::VerifyArgs,
};

/// dupe: clone disks and create or verify disk images
///
/// Drives `asr`, `hdiutil` and `diskutil` with administrator rights and shows
/// their progress.
#[derive(Parser, Debug)]
#[command(name = "dupe", version, about, long_about = None)]
pub struct Cli {
    /// Increase output verbosity (show step timings and debug info)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress tool output and progress; only report the result
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// YAML configuration file
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// How to obtain administrator rights: osascript, sudo, pkexec or none
    /// (overrides DUPE_ELEVATION and the config file)
    #[arg(long, global = true, value_name = "METHOD")]
    pub elevation: Option<ElevationMethod>,

    /// Kill a step that runs longer than this many seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Directory for daily log files (defaults to the system temp dir)
    #[arg(long, global = true, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Verbosity level resolved from --verbose / --quiet flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// --quiet: only errors and the final result
    Quiet,
    /// default: tool output and a progress bar
    Normal,
    /// --verbose: extra debug info
    Verbose,
}

impl Cli {
    /// Resolve the verbosity level from CLI flags
    pub fn verbosity(&self) -> Verbosity {
        match (self.quiet, self.verbose) {
            (true, _) => Verbosity::Quiet,
            (_, true) => Verbosity::Verbose,
            _ => Verbosity::Normal,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List disks and partitions available for cloning or imaging
    List(ListArgs),

    /// Restore a disk or image onto a target disk, erasing the target
    Clone(CloneArgs),

    /// Create a disk image file from a disk
    CreateImage(CreateImageArgs),

    /// Check that a disk image is valid for restore
    Verify(VerifyArgs),

    /// Generate shell completion scripts
    Completion(CompletionArgs),
}

/// Arguments for the `completion` command
#[derive(Args, Debug)]
pub struct CompletionArgs {
    /// The shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "dupe",
            "verify",
            "/tmp/a.dmg",
            "--elevation",
            "none",
            "--timeout",
            "60",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.elevation, Some(ElevationMethod::None));
        assert_eq!(cli.timeout, Some(60));
        assert_eq!(cli.verbosity(), Verbosity::Verbose);
    }

    #[test]
    fn test_unknown_elevation_rejected() {
        let err = Cli::try_parse_from(["dupe", "--elevation", "doas", "list"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["dupe", "-q", "-v", "list"]).is_err());
        let cli = Cli::try_parse_from(["dupe", "-q", "list"]).unwrap();
        assert_eq!(cli.verbosity(), Verbosity::Quiet);
    }

    #[test]
    fn test_default_verbosity() {
        let cli = Cli::try_parse_from(["dupe", "list"]).unwrap();
        assert_eq!(cli.verbosity(), Verbosity::Normal);
        assert!(cli.config.is_none());
        assert!(cli.log_dir.is_none());
    }

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
