use anyhow::Result;
use clap::Args;

use dupe_core::config::DupeConfig;
use dupe_core::operation::{ImageFormat, OperationRequest, default_image_name};

use crate::cli::Verbosity;

/// Arguments for the `create-image` command
#[derive(Args, Debug)]
pub struct CreateImageArgs {
    /// Source disk (e.g. /dev/disk2)
    pub source: String,

    /// Image file to write [default: <disk id>_Backup.dmg in the current directory]
    pub output: Option<String>,

    /// Write a compressed read-only image (UDZO) instead of read/write (UDRW)
    #[arg(short, long)]
    pub compressed: bool,

    /// Skip verifying the image after it is created
    #[arg(long)]
    pub no_verify: bool,
}

impl CreateImageArgs {
    fn format(&self) -> ImageFormat {
        if self.compressed {
            ImageFormat::Compressed
        } else {
            ImageFormat::ReadWrite
        }
    }

    fn request(&self) -> OperationRequest {
        let output = self
            .output
            .clone()
            .unwrap_or_else(|| default_image_name(&self.source));
        let request = OperationRequest::create_image(&self.source, output, self.format());
        if self.no_verify {
            request.without_verify()
        } else {
            request
        }
    }
}

/// Create an image file from a disk, then verify it
pub async fn run(config: &DupeConfig, args: CreateImageArgs, verbosity: Verbosity) -> Result<()> {
    super::run_operation(config, args.request(), verbosity).await
}
