use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::elevation::ElevationMethod;
use crate::error::{DupeError, Result};

/// Environment variable overriding the configured elevation method.
pub const ELEVATION_ENV: &str = "DUPE_ELEVATION";

/// Locations of the external tools the operations shell out to.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub asr: PathBuf,
    pub hdiutil: PathBuf,
    pub diskutil: PathBuf,
    pub chmod: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            asr: PathBuf::from("/usr/sbin/asr"),
            hdiutil: PathBuf::from("/usr/bin/hdiutil"),
            diskutil: PathBuf::from("/usr/sbin/diskutil"),
            chmod: PathBuf::from("/bin/chmod"),
        }
    }
}

/// Context handed to the orchestrator at construction.
///
/// Everything that would otherwise be process-wide state lives here. Loaded
/// from an optional YAML file (camelCase keys), then overridden by the
/// environment and by CLI flags.
///
/// ```yaml
/// elevation: sudo
/// tools:
///   hdiutil: /usr/bin/hdiutil
/// heartbeatIntervalMs: 500
/// stepTimeoutSecs: 7200
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DupeConfig {
    /// How commands get administrator rights.
    pub elevation: ElevationMethod,

    pub tools: ToolPaths,

    /// Wait after process exit for buffered output before detaching readers.
    pub drain_grace_ms: u64,

    /// Tick period of synthetic progress for silent steps.
    pub heartbeat_interval_ms: u64,

    /// Step-local fraction added per heartbeat tick.
    pub heartbeat_increment: f64,

    /// Per-step timeout. Absent means steps run to completion.
    pub step_timeout_secs: Option<u64>,

    /// Refuse to start an operation while another one is running.
    pub exclusive: bool,
}

impl Default for DupeConfig {
    fn default() -> Self {
        Self {
            elevation: ElevationMethod::platform_default(),
            tools: ToolPaths::default(),
            drain_grace_ms: 100,
            heartbeat_interval_ms: 500,
            heartbeat_increment: 0.05,
            step_timeout_secs: None,
            exclusive: true,
        }
    }
}

impl DupeConfig {
    /// Parse a YAML config document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        yaml_serde::from_str(content).map_err(|e| DupeError::Config(e.to_string()))
    }

    /// Read and parse a YAML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DupeError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content).map_err(|e| match e {
            DupeError::Config(msg) => DupeError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Apply `DUPE_ELEVATION` if it is set to a known method.
    ///
    /// Returns a warning for an unrecognised value instead of failing.
    pub fn apply_env(&mut self) -> Option<String> {
        let value = std::env::var(ELEVATION_ENV).ok()?;
        self.apply_elevation_override(&value)
    }

    fn apply_elevation_override(&mut self, value: &str) -> Option<String> {
        match value.parse::<ElevationMethod>() {
            Ok(method) => {
                self.elevation = method;
                None
            }
            Err(e) => Some(format!("{ELEVATION_ENV}: {e}")),
        }
    }

    /// Check for values that will not behave as the user probably expects.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !(0.0..=1.0).contains(&self.heartbeat_increment) || self.heartbeat_increment == 0.0 {
            warnings.push(format!(
                "heartbeatIncrement {} is outside (0, 1]; silent steps will show no progress",
                self.heartbeat_increment
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            warnings.push("heartbeatIntervalMs is 0; using 1ms".to_string());
        }
        if self.step_timeout_secs == Some(0) {
            warnings.push("stepTimeoutSecs is 0; every step will time out immediately".to_string());
        }
        warnings
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DupeConfig::default();
        assert_eq!(config.tools.asr, PathBuf::from("/usr/sbin/asr"));
        assert_eq!(config.tools.hdiutil, PathBuf::from("/usr/bin/hdiutil"));
        assert_eq!(config.drain_grace(), Duration::from_millis(100));
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(500));
        assert_eq!(config.step_timeout(), None);
        assert!(config.exclusive);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_yaml_keeps_defaults() {
        let yaml = r#"
elevation: none
tools:
  hdiutil: /opt/fake/hdiutil
stepTimeoutSecs: 60
"#;
        let config = DupeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.elevation, ElevationMethod::None);
        assert_eq!(config.tools.hdiutil, PathBuf::from("/opt/fake/hdiutil"));
        assert_eq!(config.tools.asr, PathBuf::from("/usr/sbin/asr"));
        assert_eq!(config.step_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.heartbeat_interval_ms, 500);
    }

    #[test]
    fn test_parse_empty_document_is_default() {
        let config = DupeConfig::from_yaml("{}").unwrap();
        assert_eq!(config, DupeConfig::default());
    }

    #[test]
    fn test_parse_rejects_unknown_elevation() {
        let err = DupeConfig::from_yaml("elevation: doas").unwrap_err();
        assert!(matches!(err, DupeError::Config(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = DupeConfig::load(Path::new("/nonexistent/dupe.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/dupe.yaml"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dupe.yaml");
        std::fs::write(&path, "exclusive: false\nheartbeatIncrement: 0.1\n").unwrap();
        let config = DupeConfig::load(&path).unwrap();
        assert!(!config.exclusive);
        assert!((config.heartbeat_increment - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_elevation_override() {
        let mut config = DupeConfig::default();
        assert_eq!(config.apply_elevation_override("pkexec"), None);
        assert_eq!(config.elevation, ElevationMethod::Pkexec);

        let warning = config.apply_elevation_override("bogus");
        assert!(warning.is_some());
        assert_eq!(config.elevation, ElevationMethod::Pkexec);
    }

    #[test]
    fn test_validate_flags_bad_values() {
        let config = DupeConfig {
            heartbeat_increment: 0.0,
            heartbeat_interval_ms: 0,
            step_timeout_secs: Some(0),
            ..DupeConfig::default()
        };
        assert_eq!(config.validate().len(), 3);
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(1));
    }
}
