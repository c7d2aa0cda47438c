use std::fmt;
use std::path::{Path, PathBuf};

/// Immutable description of one external command invocation.
///
/// Built once with the consuming builder methods, then handed to the runner.
/// Arguments are stored raw; quoting happens only when the command is
/// rendered into a shell string for the elevation wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: PathBuf,
    args: Vec<String>,
    elevated: bool,
    best_effort: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            elevated: false,
            best_effort: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Require administrator rights for this command.
    pub fn elevated(mut self) -> Self {
        self.elevated = true;
        self
    }

    /// A failure of this command does not fail the chain it belongs to.
    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn is_elevated(&self) -> bool {
        self.elevated
    }

    pub fn is_best_effort(&self) -> bool {
        self.best_effort
    }

    /// Short program name used in error messages (`/usr/bin/hdiutil` -> `hdiutil`).
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .to_string()
    }

    /// Render as a POSIX shell command with every word single-quoted.
    pub fn to_shell(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(shell_quote(&self.program.to_string_lossy()));
        words.extend(self.args.iter().map(|a| shell_quote(a)));
        words.join(" ")
    }
}

/// Human-readable form for transcripts: quotes only where a reader would
/// otherwise misread word boundaries.
impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", display_word(&self.program.to_string_lossy()))?;
        for arg in &self.args {
            write!(f, " {}", display_word(arg))?;
        }
        Ok(())
    }
}

/// Quote a string for a POSIX shell: wrap in single quotes and turn every
/// embedded `'` into `'\''`.
///
/// The result always evaluates back to exactly `raw`, whatever characters it
/// contains, so interpolated device and file paths cannot escape into the
/// surrounding command.
pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Render a chain of commands into one shell string, joined with `&&`.
///
/// Best-effort members are wrapped as `{ cmd || true; }` so their failure
/// does not short-circuit the chain or change its exit status. A final member
/// that is not best-effort replaces the shell via `exec`, so a signal sent to
/// the shell's pid lands on the tool itself.
pub fn render_chain(chain: &[CommandSpec]) -> String {
    let last = chain.len().saturating_sub(1);
    chain
        .iter()
        .enumerate()
        .map(|(i, cmd)| {
            if cmd.is_best_effort() {
                format!("{{ {} || true; }}", cmd.to_shell())
            } else if i == last {
                format!("exec {}", cmd.to_shell())
            } else {
                cmd.to_shell()
            }
        })
        .collect::<Vec<_>>()
        .join(" && ")
}

/// True when any member of the chain needs administrator rights.
pub fn chain_requires_elevation(chain: &[CommandSpec]) -> bool {
    chain.iter().any(CommandSpec::is_elevated)
}

/// Label for a chain in logs and errors: the program names joined with `&&`.
pub fn chain_label(chain: &[CommandSpec]) -> String {
    chain
        .iter()
        .filter(|c| !c.is_best_effort())
        .map(CommandSpec::program_name)
        .collect::<Vec<_>>()
        .join(" && ")
}

fn display_word(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/-_.,:=+@%".contains(c));
    if plain {
        word.to_string()
    } else {
        shell_quote(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::process::Command;

    /// Evaluate `script` with `sh -c` and return its stdout.
    fn sh_eval(script: &str) -> String {
        let output = Command::new("sh")
            .arg("-c")
            .arg(script)
            .output()
            .expect("sh should be available");
        assert!(output.status.success(), "script failed: {script}");
        String::from_utf8(output.stdout).expect("utf-8 output")
    }

    #[test]
    fn test_shell_quote_plain() {
        assert_eq!(shell_quote("/dev/disk2"), "'/dev/disk2'");
    }

    #[test]
    fn test_shell_quote_embedded_single_quotes() {
        assert_eq!(
            shell_quote("O'Brien's Disk"),
            r"'O'\''Brien'\''s Disk'"
        );
    }

    #[test]
    fn test_shell_quote_round_trips_through_sh() {
        let raw = "O'Brien's Disk";
        let script = format!("printf '%s' {}", shell_quote(raw));
        assert_eq!(sh_eval(&script), raw);
    }

    #[test]
    fn test_shell_quote_contains_metacharacters() {
        // If quoting leaked, `touch` would run and the printf output would differ.
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("pwned");
        let raw = format!("x'; touch {}; echo '$(id) `id` && | > <", marker.display());
        let script = format!("printf '%s' {}", shell_quote(&raw));
        assert_eq!(sh_eval(&script), raw);
        assert!(!marker.exists());
    }

    #[test]
    fn test_to_shell_quotes_every_word() {
        let cmd = CommandSpec::new("/usr/bin/hdiutil")
            .args(["imageinfo", "/tmp/my image.dmg"]);
        assert_eq!(
            cmd.to_shell(),
            "'/usr/bin/hdiutil' 'imageinfo' '/tmp/my image.dmg'"
        );
    }

    #[test]
    fn test_render_chain_joins_with_and() {
        let chain = vec![
            CommandSpec::new("/usr/bin/hdiutil").args(["imageinfo", "a.dmg"]),
            CommandSpec::new("/usr/bin/hdiutil").args(["verify", "a.dmg"]),
        ];
        assert_eq!(
            render_chain(&chain),
            "'/usr/bin/hdiutil' 'imageinfo' 'a.dmg' && exec '/usr/bin/hdiutil' 'verify' 'a.dmg'"
        );
    }

    #[test]
    fn test_render_chain_best_effort_does_not_fail_chain() {
        let chain = vec![
            CommandSpec::new("true"),
            CommandSpec::new("false").best_effort(),
            CommandSpec::new("echo").arg("after"),
        ];
        assert_eq!(sh_eval(&render_chain(&chain)), "after\n");
    }

    #[test]
    fn test_render_chain_keeps_best_effort_tail_out_of_exec() {
        let chain = vec![
            CommandSpec::new("/usr/bin/hdiutil").arg("create"),
            CommandSpec::new("/bin/chmod").args(["644", "a.dmg"]).best_effort(),
        ];
        assert_eq!(
            render_chain(&chain),
            "'/usr/bin/hdiutil' 'create' && { '/bin/chmod' '644' 'a.dmg' || true; }"
        );
    }

    #[test]
    fn test_render_chain_exec_keeps_exit_status() {
        let chain = vec![CommandSpec::new("true"), CommandSpec::new("sh").args(["-c", "exit 3"])];
        let output = Command::new("sh")
            .arg("-c")
            .arg(render_chain(&chain))
            .output()
            .expect("sh should be available");
        assert_eq!(output.status.code(), Some(3));
    }

    #[test]
    fn test_render_chain_short_circuits_on_failure() {
        let chain = vec![CommandSpec::new("false"), CommandSpec::new("echo").arg("never")];
        let status = Command::new("sh")
            .arg("-c")
            .arg(render_chain(&chain))
            .output()
            .expect("sh should be available");
        assert!(!status.status.success());
        assert!(status.stdout.is_empty());
    }

    #[test]
    fn test_chain_requires_elevation() {
        let plain = vec![CommandSpec::new("ls")];
        let mixed = vec![CommandSpec::new("ls"), CommandSpec::new("asr").elevated()];
        assert!(!chain_requires_elevation(&plain));
        assert!(chain_requires_elevation(&mixed));
    }

    #[test]
    fn test_chain_label_skips_best_effort() {
        let chain = vec![
            CommandSpec::new("/usr/bin/hdiutil"),
            CommandSpec::new("/bin/chmod").best_effort(),
        ];
        assert_eq!(chain_label(&chain), "hdiutil");
    }

    #[test]
    fn test_display_quotes_only_when_needed() {
        let cmd = CommandSpec::new("/usr/sbin/asr")
            .args(["--source", "/dev/disk2", "--target", "My Disk"]);
        assert_eq!(
            cmd.to_string(),
            "/usr/sbin/asr --source /dev/disk2 --target 'My Disk'"
        );
    }

    #[test]
    fn test_program_name() {
        assert_eq!(CommandSpec::new("/usr/sbin/asr").program_name(), "asr");
        assert_eq!(CommandSpec::new("hdiutil").program_name(), "hdiutil");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_shell_quote_round_trips(raw in "[^\\x00]{0,40}") {
            let script = format!("printf '%s' {}", shell_quote(&raw));
            prop_assert_eq!(sh_eval(&script), raw);
        }
    }
}
