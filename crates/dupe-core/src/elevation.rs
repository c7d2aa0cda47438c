use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Return the POSIX shell executable and flag used to evaluate rendered commands.
///
/// Commands are always rendered with POSIX single-quote escaping, so a POSIX
/// shell is required on every platform.
pub fn shell_command() -> (&'static str, &'static str) {
    ("/bin/sh", "-c")
}

/// How a finished elevated process should be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    /// The wrapped command ran and failed with this code.
    Failed(i32),
    /// The elevation mechanism never ran the command (prompt dismissed,
    /// authorization refused). Carries a description for the caller.
    Denied(String),
}

/// A mechanism that runs a shell command with administrator rights.
///
/// Implementations turn an already-quoted shell string into a spawnable
/// process and interpret that process's exit, since each mechanism reports
/// "the user cancelled the prompt" differently.
pub trait Elevate: Send + Sync + fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Build the process that runs `script` elevated.
    fn command(&self, script: &str) -> Command;

    /// Whether the process may run in its own process group. Mechanisms that
    /// prompt on the controlling terminal must stay in the foreground group.
    fn own_process_group(&self) -> bool {
        true
    }

    /// Interpret the exit code, given the last few output lines.
    fn classify_exit(&self, code: i32, _tail: &[String]) -> ExitClass {
        if code == 0 {
            ExitClass::Success
        } else {
            ExitClass::Failed(code)
        }
    }
}

/// Built-in elevation mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElevationMethod {
    /// macOS: `osascript -e 'do shell script "…" with administrator privileges'`,
    /// which shows the system authentication dialog.
    Osascript,
    /// `sudo /bin/sh -c …`, prompting on the controlling terminal.
    Sudo,
    /// polkit: `pkexec /bin/sh -c …`.
    Pkexec,
    /// Run unelevated. For hosts already running as root, and for tests.
    None,
}

impl ElevationMethod {
    /// `osascript` on macOS, `sudo` everywhere else.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "macos") {
            ElevationMethod::Osascript
        } else {
            ElevationMethod::Sudo
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ElevationMethod::Osascript => "osascript",
            ElevationMethod::Sudo => "sudo",
            ElevationMethod::Pkexec => "pkexec",
            ElevationMethod::None => "none",
        }
    }
}

impl Default for ElevationMethod {
    fn default() -> Self {
        Self::platform_default()
    }
}

impl fmt::Display for ElevationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElevationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "osascript" => Ok(ElevationMethod::Osascript),
            "sudo" => Ok(ElevationMethod::Sudo),
            "pkexec" => Ok(ElevationMethod::Pkexec),
            "none" => Ok(ElevationMethod::None),
            other => Err(format!(
                "unknown elevation method '{other}' (expected osascript, sudo, pkexec or none)"
            )),
        }
    }
}

/// `osascript` reports script failures as
/// `0:123: execution error: <message> (<code>)` on its last line.
static OSASCRIPT_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    // safety: this regex is valid and tested
    Regex::new(r"execution error: .*\((-?\d+)\)\s*$").expect("valid regex")
});

/// AppleScript error number for "User canceled."
const OSASCRIPT_USER_CANCELED: i32 = -128;

impl Elevate for ElevationMethod {
    fn name(&self) -> &'static str {
        self.as_str()
    }

    fn own_process_group(&self) -> bool {
        // sudo and pkexec's text agent read the password from the terminal
        !matches!(self, ElevationMethod::Sudo | ElevationMethod::Pkexec)
    }

    fn command(&self, script: &str) -> Command {
        let (shell, flag) = shell_command();
        match self {
            ElevationMethod::Osascript => {
                let mut cmd = Command::new("/usr/bin/osascript");
                cmd.arg("-e").arg(format!(
                    "do shell script \"{}\" with administrator privileges",
                    applescript_escape(script)
                ));
                cmd
            }
            ElevationMethod::Sudo => {
                let mut cmd = Command::new("sudo");
                cmd.arg("--").arg(shell).arg(flag).arg(script);
                cmd
            }
            ElevationMethod::Pkexec => {
                let mut cmd = Command::new("pkexec");
                cmd.arg(shell).arg(flag).arg(script);
                cmd
            }
            ElevationMethod::None => {
                let mut cmd = Command::new(shell);
                cmd.arg(flag).arg(script);
                cmd
            }
        }
    }

    fn classify_exit(&self, code: i32, tail: &[String]) -> ExitClass {
        if code == 0 {
            return ExitClass::Success;
        }
        match self {
            ElevationMethod::Osascript => {
                let inner = tail
                    .iter()
                    .rev()
                    .find_map(|line| OSASCRIPT_ERROR_RE.captures(line))
                    .and_then(|caps| caps[1].parse::<i32>().ok());
                match inner {
                    Some(OSASCRIPT_USER_CANCELED) => ExitClass::Denied(
                        "administrator authentication was cancelled".to_string(),
                    ),
                    Some(inner) => ExitClass::Failed(inner),
                    None => ExitClass::Failed(code),
                }
            }
            // pkexec: 126 = dialog dismissed, 127 = not authorized
            ElevationMethod::Pkexec if code == 126 => {
                ExitClass::Denied("authorization dialog was dismissed".to_string())
            }
            ElevationMethod::Pkexec if code == 127 => {
                ExitClass::Denied("not authorized to run as administrator".to_string())
            }
            ElevationMethod::Sudo
                if tail.iter().any(|l| {
                    l.contains("incorrect password attempt") || l.contains("a password is required")
                }) =>
            {
                ExitClass::Denied("sudo authentication failed".to_string())
            }
            _ => ExitClass::Failed(code),
        }
    }
}

/// Escape a string for embedding in an AppleScript string literal.
pub fn applescript_escape(raw: &str) -> String {
    raw.replace('\\', r"\\").replace('"', r#"\""#)
}
