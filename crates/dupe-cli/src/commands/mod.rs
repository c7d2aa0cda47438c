pub mod clone;
pub mod create_image;
pub mod list;
pub mod verify;

use anyhow::{Context, Result};
use colored::Colorize;

use dupe_core::config::DupeConfig;
use dupe_core::error::DupeError;
use dupe_core::operation::OperationRequest;
use dupe_core::orchestrator::{OperationOutcome, Orchestrator};

use crate::cli::{Cli, Verbosity};
use crate::render;

/// Resolve the effective configuration.
///
/// Precedence: CLI flags, then `DUPE_ELEVATION`, then the config file, then
/// built-in defaults. Warnings are printed, not fatal.
pub fn load_config(cli: &Cli) -> Result<DupeConfig> {
    let mut config = match &cli.config {
        Some(path) => DupeConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => DupeConfig::default(),
    };

    let mut warnings = Vec::new();
    warnings.extend(config.apply_env());
    if let Some(method) = cli.elevation {
        config.elevation = method;
    }
    if let Some(secs) = cli.timeout {
        config.step_timeout_secs = Some(secs);
    }
    warnings.extend(config.validate());

    for warning in &warnings {
        eprintln!("{} {}", "WARNING:".yellow().bold(), warning);
        tracing::warn!(%warning, "configuration");
    }
    tracing::debug!(elevation = %config.elevation, "configuration resolved");
    Ok(config)
}

/// Run one operation to completion, rendering its events.
///
/// Ctrl-C cancels the operation; the result is then `DupeError::Cancelled`.
pub async fn run_operation(
    config: &DupeConfig,
    request: OperationRequest,
    verbosity: Verbosity,
) -> Result<()> {
    let orchestrator = Orchestrator::new(config.clone());
    let mut handle = orchestrator.start(request)?;
    let events = handle
        .take_events()
        .context("operation event stream already taken")?;
    let renderer = render::spawn_renderer(events, verbosity);

    let canceller = handle.canceller();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling operation");
            canceller.cancel();
        }
    });

    let outcome = handle.wait().await;
    interrupt.abort();
    renderer.await??;

    match outcome {
        OperationOutcome::Succeeded => {
            if verbosity != Verbosity::Quiet {
                println!("\n{}", "SUCCESS".green().bold());
            }
            Ok(())
        }
        OperationOutcome::Failed(e) => Err(e.into()),
        OperationOutcome::Cancelled => Err(DupeError::Cancelled.into()),
    }
}

/// Process exit code for a failed command: 130 for cancellation, 1 otherwise.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<DupeError>() {
        Some(DupeError::Cancelled) => 130,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code(&DupeError::Cancelled.into()), 130);
        assert_eq!(
            exit_code(
                &DupeError::CommandExit {
                    program: "asr".to_string(),
                    code: 2
                }
                .into()
            ),
            1
        );
        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
    }

    #[test]
    fn test_cli_flags_override_config_file() {
        use clap::Parser;
        use dupe_core::elevation::ElevationMethod;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dupe.yaml");
        std::fs::write(&path, "elevation: pkexec\nstepTimeoutSecs: 10\n").unwrap();

        let cli = Cli::try_parse_from([
            "dupe",
            "--config",
            path.to_str().unwrap(),
            "--elevation",
            "none",
            "list",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.elevation, ElevationMethod::None);
        assert_eq!(config.step_timeout_secs, Some(10));
    }

    #[test]
    fn test_missing_config_file_is_error() {
        use clap::Parser;
        let cli = Cli::try_parse_from(["dupe", "--config", "/nonexistent/dupe.yaml", "list"]).unwrap();
        let err = load_config(&cli).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/dupe.yaml"));
    }
}
