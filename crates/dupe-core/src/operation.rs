use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::command::CommandSpec;
use crate::config::ToolPaths;
use crate::error::{DupeError, Result};
use crate::progress::StepSpan;

/// Portion of create-then-verify spent creating the image.
pub const CREATE_SPAN_END: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Full-device restore onto a target, erasing it.
    Clone,
    /// Create an image file from a device, then verify it unless disabled.
    CreateImage,
    /// Check that an existing image is valid for restore.
    VerifyImage,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Clone => "clone",
            OperationKind::CreateImage => "create-image",
            OperationKind::VerifyImage => "verify-image",
        })
    }
}

/// Disk image format passed to `hdiutil create -format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ImageFormat {
    /// UDRW: uncompressed read/write.
    #[default]
    ReadWrite,
    /// UDZO: zlib-compressed read-only.
    Compressed,
}

impl ImageFormat {
    pub fn code(&self) -> &'static str {
        match self {
            ImageFormat::ReadWrite => "UDRW",
            ImageFormat::Compressed => "UDZO",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ImageFormat::ReadWrite => "UDRW (read/write)",
            ImageFormat::Compressed => "UDZO (compressed)",
        }
    }
}

/// One user-initiated task. Never mutated once accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    kind: OperationKind,
    source: String,
    target: Option<String>,
    format: ImageFormat,
    verify_after_create: bool,
}

impl OperationRequest {
    /// Clone `source` (a device such as `/dev/disk2`, or an image file) onto
    /// the `target` device. Everything on the target is erased.
    pub fn clone_disk(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Clone,
            source: source.into(),
            target: Some(target.into()),
            format: ImageFormat::default(),
            verify_after_create: false,
        }
    }

    /// Create an image file at `output` from the `source` device, then verify it.
    ///
    /// `hdiutil create` appends `.dmg` to names without it, so the request
    /// does the same and every later step sees the file actually written.
    pub fn create_image(
        source: impl Into<String>,
        output: impl Into<String>,
        format: ImageFormat,
    ) -> Self {
        Self {
            kind: OperationKind::CreateImage,
            source: source.into(),
            target: Some(with_image_extension(output.into())),
            format,
            verify_after_create: true,
        }
    }

    /// Verify an existing image file.
    pub fn verify_image(path: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::VerifyImage,
            source: path.into(),
            target: None,
            format: ImageFormat::default(),
            verify_after_create: false,
        }
    }

    /// Skip the verification pass after creating an image.
    pub fn without_verify(mut self) -> Self {
        self.verify_after_create = false;
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn verifies_after_create(&self) -> bool {
        self.verify_after_create
    }

    /// Reject requests that cannot succeed before anything is launched.
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(DupeError::InvalidRequest("source is empty".to_string()));
        }
        match self.kind {
            OperationKind::Clone => {
                let target = self.required_target()?;
                if target == self.source {
                    return Err(DupeError::InvalidRequest(
                        "source and target are the same device".to_string(),
                    ));
                }
                if !is_device(&self.source) && !Path::new(&self.source).is_file() {
                    return Err(DupeError::InvalidRequest(format!(
                        "clone source {} is neither a device nor an existing image file",
                        self.source
                    )));
                }
            }
            OperationKind::CreateImage => {
                let target = self.required_target()?;
                if Path::new(target).file_name().is_none() || target.ends_with('/') {
                    return Err(DupeError::InvalidRequest(format!(
                        "output {target} has no file name"
                    )));
                }
            }
            OperationKind::VerifyImage => {
                if !Path::new(&self.source).is_file() {
                    return Err(DupeError::InvalidRequest(format!(
                        "image {} does not exist",
                        self.source
                    )));
                }
            }
        }
        Ok(())
    }

    fn required_target(&self) -> Result<&str> {
        match self.target.as_deref() {
            Some(t) if !t.trim().is_empty() => Ok(t),
            _ => Err(DupeError::InvalidRequest("target is empty".to_string())),
        }
    }
}

/// `backup` -> `backup.dmg`. Names already ending in `.dmg` (any case), and
/// outputs with no file name, are left alone.
pub fn with_image_extension(mut output: String) -> String {
    let has_name = !output.trim().is_empty() && !output.ends_with('/');
    if has_name && !output.to_ascii_lowercase().ends_with(".dmg") {
        output.push_str(".dmg");
    }
    output
}

/// Whether `path` names a device node rather than a file.
pub fn is_device(path: &str) -> bool {
    path.starts_with("/dev/")
}

/// How a step produces progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    /// Percentages are parsed from the tool's output.
    Parsed,
    /// The tool is silent; synthesize heartbeat progress. Parsed
    /// percentages are still honoured if any appear.
    Heartbeat,
}

/// One sequential unit of an operation: a command chain run as one process.
#[derive(Debug, Clone)]
pub struct Step {
    pub label: String,
    pub commands: Vec<CommandSpec>,
    pub span: StepSpan,
    pub mode: ProgressMode,
    /// Transcript lines emitted before the step starts.
    pub intro: Vec<String>,
    /// Transcript lines emitted after the step succeeds.
    pub outro: Vec<String>,
    /// File to normalize to mode 0644 after the step succeeds.
    pub normalize_permissions: Option<PathBuf>,
}

impl Step {
    pub fn new(label: impl Into<String>, commands: Vec<CommandSpec>) -> Self {
        Self {
            label: label.into(),
            commands,
            span: StepSpan::FULL,
            mode: ProgressMode::Parsed,
            intro: Vec::new(),
            outro: Vec::new(),
            normalize_permissions: None,
        }
    }

    pub fn span(mut self, span: StepSpan) -> Self {
        self.span = span;
        self
    }

    pub fn mode(mut self, mode: ProgressMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn intro<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.intro.extend(lines.into_iter().map(Into::into));
        self
    }

    pub fn outro<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outro.extend(lines.into_iter().map(Into::into));
        self
    }

    pub fn normalize_permissions(mut self, path: impl Into<PathBuf>) -> Self {
        self.normalize_permissions = Some(path.into());
        self
    }
}

/// The ordered steps of one operation.
#[derive(Debug, Clone)]
pub struct Plan {
    pub kind: OperationKind,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(kind: OperationKind, steps: Vec<Step>) -> Self {
        Self { kind, steps }
    }

    /// Build the plan for a request using the configured tool locations.
    pub fn for_request(request: &OperationRequest, tools: &ToolPaths) -> Self {
        let steps = match request.kind() {
            OperationKind::Clone => {
                vec![clone_step(tools, request.source(), request.target().unwrap_or_default())]
            }
            OperationKind::CreateImage => {
                let output = request.target().unwrap_or_default();
                if request.verifies_after_create() {
                    vec![
                        create_step(tools, request.source(), output, request.format())
                            .span(StepSpan::new(0.0, CREATE_SPAN_END)),
                        verify_step(tools, output).span(StepSpan::new(CREATE_SPAN_END, 1.0)),
                    ]
                } else {
                    vec![create_step(tools, request.source(), output, request.format())]
                }
            }
            OperationKind::VerifyImage => vec![verify_step(tools, request.source())],
        };
        Self::new(request.kind(), steps)
    }
}

/// `asr --source <src> --target <dst> --erase --noprompt --verbose`
pub fn clone_command(tools: &ToolPaths, source: &str, target: &str) -> CommandSpec {
    CommandSpec::new(&tools.asr)
        .args(["--source", source, "--target", target])
        .args(["--erase", "--noprompt", "--verbose"])
        .elevated()
}

/// `hdiutil create -srcdevice <src> <dst> -format UDZO|UDRW -verbose`
pub fn create_image_command(
    tools: &ToolPaths,
    source: &str,
    output: &str,
    format: ImageFormat,
) -> CommandSpec {
    CommandSpec::new(&tools.hdiutil)
        .args(["create", "-srcdevice", source, output])
        .args(["-format", format.code(), "-verbose"])
        .elevated()
}

/// `hdiutil imageinfo <path> && hdiutil verify <path>`
pub fn verify_image_commands(tools: &ToolPaths, image: &str) -> Vec<CommandSpec> {
    vec![
        CommandSpec::new(&tools.hdiutil)
            .args(["imageinfo", image])
            .elevated(),
        CommandSpec::new(&tools.hdiutil)
            .args(["verify", image])
            .elevated(),
    ]
}

fn clone_step(tools: &ToolPaths, source: &str, target: &str) -> Step {
    let command = clone_command(tools, source, target);
    Step::new("Clone", vec![command.clone()])
        .intro([
            "Starting ASR clone operation...".to_string(),
            format!("Source: {source}"),
            format!("Target: {target}"),
            "All data on target will be erased!".to_string(),
            format!("Executing: {command}"),
        ])
        .outro(["Clone operation completed successfully!"])
}

fn create_step(tools: &ToolPaths, source: &str, output: &str, format: ImageFormat) -> Step {
    let command = create_image_command(tools, source, output, format);
    let chmod = CommandSpec::new(&tools.chmod)
        .args(["644", output])
        .elevated()
        .best_effort();

    let mut outro = vec![
        "Image creation completed successfully!".to_string(),
        format!("Output file: {output}"),
    ];
    if format == ImageFormat::Compressed {
        outro.push("Note: UDZO images are compressed and read-only".to_string());
    }

    Step::new("Create image", vec![command.clone(), chmod])
        .intro([
            "Starting image creation...".to_string(),
            format!("Source: {source}"),
            format!("Output file: {output}"),
            format!("Format: {}", format.description()),
            format!("Executing: {command}"),
        ])
        .outro(outro)
        .normalize_permissions(output)
}

fn verify_step(tools: &ToolPaths, image: &str) -> Step {
    Step::new("Verify image", verify_image_commands(tools, image))
        .mode(ProgressMode::Heartbeat)
        .intro([
            format!("Scanning image: {image}"),
            "Verifying the image can be used for restore...".to_string(),
            "Executing: hdiutil imageinfo && hdiutil verify".to_string(),
        ])
        .outro(["Image scan completed - image is valid for restore!"])
}

/// Default output file name for an image of `device`: `disk2_Backup.dmg`.
pub fn default_image_name(device: &str) -> String {
    let id = device.trim_start_matches("/dev/");
    if id.is_empty() {
        "Backup.dmg".to_string()
    } else {
        format!("{id}_Backup.dmg")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::render_chain;

    fn args(cmd: &CommandSpec) -> Vec<&str> {
        cmd.arguments().iter().map(String::as_str).collect()
    }

    #[test]
    fn test_clone_command_shape() {
        let cmd = clone_command(&ToolPaths::default(), "/dev/disk2", "/dev/disk3");
        assert_eq!(cmd.program(), Path::new("/usr/sbin/asr"));
        assert_eq!(
            args(&cmd),
            vec![
                "--source",
                "/dev/disk2",
                "--target",
                "/dev/disk3",
                "--erase",
                "--noprompt",
                "--verbose"
            ]
        );
        assert!(cmd.is_elevated());
    }

    #[test]
    fn test_create_image_command_shapes() {
        let tools = ToolPaths::default();
        let udzo = create_image_command(&tools, "/dev/disk2", "/tmp/a.dmg", ImageFormat::Compressed);
        assert_eq!(
            args(&udzo),
            vec!["create", "-srcdevice", "/dev/disk2", "/tmp/a.dmg", "-format", "UDZO", "-verbose"]
        );
        let udrw = create_image_command(&tools, "/dev/disk2", "/tmp/a.dmg", ImageFormat::ReadWrite);
        assert_eq!(args(&udrw)[5], "UDRW");
    }

    #[test]
    fn test_verify_commands_render_as_and_chain() {
        let chain = verify_image_commands(&ToolPaths::default(), "/tmp/O'Brien.dmg");
        assert_eq!(
            render_chain(&chain),
            r"'/usr/bin/hdiutil' 'imageinfo' '/tmp/O'\''Brien.dmg' && exec '/usr/bin/hdiutil' 'verify' '/tmp/O'\''Brien.dmg'"
        );
    }

    #[test]
    fn test_with_image_extension() {
        assert_eq!(with_image_extension("backup".into()), "backup.dmg");
        assert_eq!(with_image_extension("/tmp/a.img".into()), "/tmp/a.img.dmg");
        assert_eq!(with_image_extension("/tmp/a.dmg".into()), "/tmp/a.dmg");
        assert_eq!(with_image_extension("/tmp/A.DMG".into()), "/tmp/A.DMG");
        assert_eq!(with_image_extension("/tmp/".into()), "/tmp/");
        assert_eq!(with_image_extension(String::new()), "");
    }

    #[test]
    fn test_plan_uses_extended_output_for_every_step() {
        let req = OperationRequest::create_image("/dev/disk2", "/tmp/mybackup", ImageFormat::ReadWrite);
        assert_eq!(req.target(), Some("/tmp/mybackup.dmg"));

        let plan = Plan::for_request(&req, &ToolPaths::default());
        let create = &plan.steps[0];
        assert_eq!(args(&create.commands[0])[3], "/tmp/mybackup.dmg");
        assert_eq!(args(&create.commands[1]), vec!["644", "/tmp/mybackup.dmg"]);
        assert_eq!(
            create.normalize_permissions,
            Some(PathBuf::from("/tmp/mybackup.dmg"))
        );
        for cmd in &plan.steps[1].commands {
            assert_eq!(args(cmd)[1], "/tmp/mybackup.dmg");
        }
    }

    #[test]
    fn test_plan_clone_single_full_step() {
        let req = OperationRequest::clone_disk("/dev/disk2", "/dev/disk3");
        let plan = Plan::for_request(&req, &ToolPaths::default());
        assert_eq!(plan.kind, OperationKind::Clone);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].span, StepSpan::FULL);
        assert_eq!(plan.steps[0].mode, ProgressMode::Parsed);
        assert!(plan.steps[0].intro.iter().any(|l| l.contains("erased")));
    }

    #[test]
    fn test_plan_create_then_verify_spans() {
        let req = OperationRequest::create_image("/dev/disk2", "/tmp/b.dmg", ImageFormat::Compressed);
        let plan = Plan::for_request(&req, &ToolPaths::default());
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].span, StepSpan::new(0.0, 0.7));
        assert_eq!(plan.steps[1].span, StepSpan::new(0.7, 1.0));
        assert_eq!(plan.steps[0].mode, ProgressMode::Parsed);
        assert_eq!(plan.steps[1].mode, ProgressMode::Heartbeat);
        assert_eq!(
            plan.steps[0].normalize_permissions,
            Some(PathBuf::from("/tmp/b.dmg"))
        );
        // hdiutil create plus best-effort chmod in the same elevated process
        assert_eq!(plan.steps[0].commands.len(), 2);
        assert!(plan.steps[0].commands[1].is_best_effort());
        assert!(plan.steps[0].outro.iter().any(|l| l.contains("UDZO")));
    }

    #[test]
    fn test_plan_create_without_verify() {
        let req = OperationRequest::create_image("/dev/disk2", "/tmp/b.dmg", ImageFormat::ReadWrite)
            .without_verify();
        let plan = Plan::for_request(&req, &ToolPaths::default());
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].span, StepSpan::FULL);
    }

    #[test]
    fn test_plan_verify_is_heartbeat() {
        let req = OperationRequest::verify_image("/tmp/c.dmg");
        let plan = Plan::for_request(&req, &ToolPaths::default());
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].mode, ProgressMode::Heartbeat);
        assert_eq!(plan.steps[0].commands.len(), 2);
    }

    #[test]
    fn test_validate_rejects_empty_source() {
        let req = OperationRequest::clone_disk("  ", "/dev/disk3");
        assert!(matches!(req.validate(), Err(DupeError::InvalidRequest(_))));
    }

    #[test]
    fn test_validate_rejects_clone_onto_itself() {
        let req = OperationRequest::clone_disk("/dev/disk2", "/dev/disk2");
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("same device"));
    }

    #[test]
    fn test_validate_clone_from_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("backup.dmg");
        std::fs::write(&image, b"image").unwrap();

        let ok = OperationRequest::clone_disk(image.to_string_lossy(), "/dev/disk3");
        assert!(ok.validate().is_ok());

        let missing = OperationRequest::clone_disk(
            dir.path().join("missing.dmg").to_string_lossy(),
            "/dev/disk3",
        );
        assert!(missing.validate().is_err());
    }

    #[test]
    fn test_validate_create_requires_file_name() {
        let req = OperationRequest::create_image("/dev/disk2", "/tmp/", ImageFormat::ReadWrite);
        assert!(req.validate().is_err());
        let req = OperationRequest::create_image("/dev/disk2", "", ImageFormat::ReadWrite);
        assert!(req.validate().is_err());
        let req = OperationRequest::create_image("/dev/disk2", "/tmp/x.dmg", ImageFormat::ReadWrite);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_validate_verify_requires_existing_image() {
        let req = OperationRequest::verify_image("/nonexistent/image.dmg");
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_default_image_name() {
        assert_eq!(default_image_name("/dev/disk2"), "disk2_Backup.dmg");
        assert_eq!(default_image_name("/dev/disk2s1"), "disk2s1_Backup.dmg");
        assert_eq!(default_image_name(""), "Backup.dmg");
    }

    #[test]
    fn test_image_format_codes() {
        assert_eq!(ImageFormat::ReadWrite.code(), "UDRW");
        assert_eq!(ImageFormat::Compressed.code(), "UDZO");
        assert_eq!(ImageFormat::default(), ImageFormat::ReadWrite);
    }
}
