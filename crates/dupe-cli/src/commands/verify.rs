use anyhow::Result;
use clap::Args;

use dupe_core::config::DupeConfig;
use dupe_core::operation::OperationRequest;

use crate::cli::Verbosity;

/// Arguments for the `verify` command
#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Disk image to check
    pub image: String,
}

/// Verify that an image can be used for restore
pub async fn run(config: &DupeConfig, args: VerifyArgs, verbosity: Verbosity) -> Result<()> {
    let request = OperationRequest::verify_image(args.image);
    super::run_operation(config, request, verbosity).await
}

#[cfg(test)]
mod tests {
    use crate::cli::{Cli, Commands};
    use clap::Parser;

    #[test]
    fn test_parse_verify() {
        let cli = Cli::try_parse_from(["dupe", "verify", "/tmp/disk2_Backup.dmg"]).unwrap();
        match cli.command {
            Commands::Verify(args) => assert_eq!(args.image, "/tmp/disk2_Backup.dmg"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_verify_requires_image() {
        assert!(Cli::try_parse_from(["dupe", "verify"]).is_err());
    }
}
