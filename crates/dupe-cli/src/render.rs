use anyhow::Result;
use colored::{ColoredString, Colorize};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use dupe_core::events::{Event, OperationStatus};

use crate::cli::Verbosity;

/// Bar length; progress fractions are mapped onto this many positions.
const BAR_POSITIONS: u64 = 1000;

/// How a transcript line should be highlighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Error,
    Success,
    Warning,
    Plain,
}

/// Classify a line of tool output by the keywords it contains.
pub fn classify_line(line: &str) -> LineKind {
    if line.contains('❌') || line.contains("error") || line.contains("Error") || line.contains("failed")
    {
        LineKind::Error
    } else if line.contains('✅') || line.contains("success") || line.contains("completed") {
        LineKind::Success
    } else if line.contains("⚠️") || line.contains("warning") || line.contains("Warning") {
        LineKind::Warning
    } else {
        LineKind::Plain
    }
}

fn highlight(line: &str) -> ColoredString {
    match classify_line(line) {
        LineKind::Error => line.red(),
        LineKind::Success => line.green(),
        LineKind::Warning => line.yellow(),
        LineKind::Plain => line.normal(),
    }
}

/// Create the operation progress bar.
///
/// `{spinner} [{bar}] {percent}% {msg}`
pub fn create_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(BAR_POSITIONS);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {percent:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb
}

/// Map an overall progress fraction onto a bar position.
pub fn bar_position(value: f64) -> u64 {
    (value.clamp(0.0, 1.0) * BAR_POSITIONS as f64).round() as u64
}

/// Spawn a renderer task consuming one operation's events.
///
/// The task ends when the operation drops its event sender.
pub fn spawn_renderer(
    rx: mpsc::UnboundedReceiver<Event>,
    verbosity: Verbosity,
) -> JoinHandle<Result<()>> {
    let pb = match verbosity {
        Verbosity::Quiet => None,
        _ => Some(create_progress_bar()),
    };
    tokio::spawn(async move { render_loop(rx, pb, verbosity).await })
}

/// Print above the progress bar when it is drawn, plainly otherwise.
fn say(pb: &Option<ProgressBar>, text: impl std::fmt::Display) {
    match pb {
        Some(pb) if !pb.is_hidden() => pb.println(text.to_string()),
        _ => println!("{text}"),
    }
}

/// Internal render loop that processes events and produces terminal output.
async fn render_loop(
    mut rx: mpsc::UnboundedReceiver<Event>,
    pb: Option<ProgressBar>,
    verbosity: Verbosity,
) -> Result<()> {
    let quiet = verbosity == Verbosity::Quiet;
    let verbose = verbosity == Verbosity::Verbose;

    while let Some(event) = rx.recv().await {
        match event {
            Event::OperationStarted { id, kind, steps } => {
                if verbose {
                    say(&pb, format!("{} operation #{id}: {kind} ({steps} steps)", "DEBUG".dimmed()));
                }
            }
            Event::StepStarted {
                index,
                total,
                ref label,
                ..
            } => {
                if let Some(ref pb) = pb {
                    pb.set_message(format!("{label} ({}/{total})", index + 1));
                }
            }
            Event::StepFinished {
                index,
                success,
                duration,
                ..
            } => {
                if verbose {
                    let elapsed = format!("({:.1}s)", duration.as_secs_f64());
                    let status = if success { "done".green() } else { "failed".red() };
                    say(&pb, format!("{} step {} {} {}", "DEBUG".dimmed(), index + 1, status, elapsed.dimmed()));
                }
            }
            Event::Output(ref output) => {
                if !quiet {
                    say(&pb, highlight(&output.line));
                }
            }
            Event::Info { ref message, .. } => {
                if !quiet {
                    say(&pb, highlight(message).bold());
                }
            }
            Event::Progress { value, .. } => {
                if let Some(ref pb) = pb {
                    pb.set_position(bar_position(value));
                }
            }
            Event::Warning { ref message, .. } => {
                say(&pb, format!("{} {}", "WARNING:".yellow().bold(), message));
            }
            Event::OperationFinished {
                status, duration, ..
            } => {
                if let Some(ref pb) = pb {
                    if status == OperationStatus::Succeeded {
                        pb.finish_and_clear();
                    } else {
                        pb.abandon();
                    }
                }
                if verbose {
                    println!(
                        "{} finished in {:.1}s",
                        "DEBUG".dimmed(),
                        duration.as_secs_f64()
                    );
                }
            }
        }
    }

    if let Some(pb) = pb
        && !pb.is_finished()
    {
        pb.finish_and_clear();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dupe_core::events::OutputEvent;
    use dupe_core::operation::OperationKind;
    use std::time::Duration;

    #[test]
    fn test_classify_line() {
        assert_eq!(classify_line("hdiutil: create failed - Resource busy"), LineKind::Error);
        assert_eq!(classify_line("❌ Clone failed"), LineKind::Error);
        assert_eq!(classify_line("Clone operation completed successfully!"), LineKind::Success);
        assert_eq!(classify_line("All data on target will be erased! warning"), LineKind::Warning);
        assert_eq!(classify_line("Validating target...done"), LineKind::Plain);
    }

    #[test]
    fn test_error_wins_over_success() {
        assert_eq!(classify_line("completed with error"), LineKind::Error);
    }

    #[test]
    fn test_bar_position() {
        assert_eq!(bar_position(0.0), 0);
        assert_eq!(bar_position(0.315), 315);
        assert_eq!(bar_position(1.0), BAR_POSITIONS);
        assert_eq!(bar_position(1.5), BAR_POSITIONS);
        assert_eq!(bar_position(-0.1), 0);
    }

    #[tokio::test]
    async fn test_render_loop_ends_when_sender_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_renderer(rx, Verbosity::Quiet);
        tx.send(Event::OperationStarted {
            id: 1,
            kind: OperationKind::VerifyImage,
            steps: 1,
        })
        .unwrap();
        tx.send(Event::Output(OutputEvent {
            operation: 1,
            line: "checksum ok".to_string(),
        }))
        .unwrap();
        tx.send(Event::OperationFinished {
            id: 1,
            status: OperationStatus::Succeeded,
            message: None,
            duration: Duration::from_millis(5),
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap().unwrap();
    }
}
