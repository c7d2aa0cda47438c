use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};

use crate::error::{DupeError, Result};
use crate::operation::default_image_name;

/// Partition content types that are never useful as a clone source or target.
const RESERVED_CONTENT: &[&str] = &["EFI", "Apple_Boot", "Apple_APFS_Recovery", "Apple_APFS_ISC"];

/// System-managed APFS volume names.
const RESERVED_NAMES: &[&str] = &[
    "Recovery",
    "Preboot",
    "VM",
    "Update",
    "xART",
    "Hardware",
    "iSCPreboot",
];

/// One disk or partition available for cloning or imaging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskInfo {
    /// Device path, e.g. `/dev/disk2s1`.
    pub device_identifier: String,
    pub name: String,
    /// Human-readable size, e.g. `500.28 GB`.
    pub size: String,
    pub size_bytes: u64,
    /// Partition scheme or content type as reported by diskutil.
    pub content: String,
}

impl DiskInfo {
    /// `"<name> (<device>) - <size>"`, the label shown in pickers.
    pub fn display_name(&self) -> String {
        format!("{} ({}) - {}", self.name, self.device_identifier, self.size)
    }

    /// Suggested file name for an image of this device.
    pub fn default_image_name(&self) -> String {
        default_image_name(&self.device_identifier)
    }

    /// Whether this entry is a firmware, recovery or system-reserved volume.
    pub fn is_reserved(&self) -> bool {
        RESERVED_CONTENT.contains(&self.content.as_str())
            || RESERVED_NAMES.contains(&self.name.as_str())
    }
}

// Subset of `diskutil list -plist` output.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiskList {
    all_disks_and_partitions: Vec<DiskEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiskEntry {
    device_identifier: Option<String>,
    size: Option<u64>,
    volume_name: Option<String>,
    media_name: Option<String>,
    content: Option<String>,
    #[serde(default)]
    partitions: Vec<DiskEntry>,
    #[serde(default, rename = "APFSVolumes")]
    apfs_volumes: Vec<DiskEntry>,
}

impl DiskEntry {
    fn to_info(&self, fallback: &str) -> Option<DiskInfo> {
        let id = self.device_identifier.as_deref()?;
        let size = self.size?;
        let non_empty = |n: &&str| !n.trim().is_empty();
        let name = self
            .volume_name
            .as_deref()
            .filter(non_empty)
            .or(self.media_name.as_deref().filter(non_empty))
            .unwrap_or(fallback);
        Some(DiskInfo {
            device_identifier: format!("/dev/{id}"),
            name: name.to_string(),
            size: format_size(size),
            size_bytes: size,
            content: self.content.clone().unwrap_or_else(|| fallback.to_string()),
        })
    }
}

/// Lists attached disks through `diskutil list -plist`.
#[derive(Debug, Clone)]
pub struct DiskInventory {
    diskutil: PathBuf,
    include_reserved: bool,
}

impl DiskInventory {
    pub fn new(diskutil: impl Into<PathBuf>) -> Self {
        Self {
            diskutil: diskutil.into(),
            include_reserved: false,
        }
    }

    /// Keep firmware, recovery and system volumes in the listing.
    pub fn include_reserved(mut self, include: bool) -> Self {
        self.include_reserved = include;
        self
    }

    pub fn diskutil(&self) -> &Path {
        &self.diskutil
    }

    /// Run diskutil and parse its listing.
    pub async fn list(&self) -> Result<Vec<DiskInfo>> {
        let program = self
            .diskutil
            .file_name()
            .unwrap_or(self.diskutil.as_os_str())
            .to_string_lossy()
            .to_string();
        tracing::debug!(diskutil = %self.diskutil.display(), "listing disks");

        let output = tokio::process::Command::new(&self.diskutil)
            .args(["list", "-plist"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DupeError::CommandLaunch {
                program: program.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(DupeError::CommandExit {
                program,
                code: output.status.code().unwrap_or(-1),
            });
        }
        self.parse(&output.stdout)
    }

    /// Decode a `diskutil list -plist` document into sorted disk records.
    ///
    /// Whole disks, their partitions and their APFS volumes are all listed.
    /// Entries missing an identifier or a size are skipped.
    pub fn parse(&self, plist: &[u8]) -> Result<Vec<DiskInfo>> {
        let list: DiskList = plist::from_bytes(plist)
            .map_err(|e| DupeError::Parse(format!("failed to parse diskutil output: {e}")))?;

        let mut disks = Vec::new();
        for disk in &list.all_disks_and_partitions {
            disks.extend(disk.to_info("Unknown"));
            for child in disk.partitions.iter().chain(&disk.apfs_volumes) {
                disks.extend(child.to_info("Partition"));
            }
        }
        if !self.include_reserved {
            disks.retain(|d| !d.is_reserved());
        }
        disks.sort_by(|a, b| a.device_identifier.cmp(&b.device_identifier));
        Ok(disks)
    }
}

/// Format a byte count the way the macOS file size formatter does: decimal
/// (1000-based) units, more precision for larger units.
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "Zero KB".to_string();
    }
    if bytes < 1000 {
        return if bytes == 1 {
            "1 byte".to_string()
        } else {
            format!("{bytes} bytes")
        };
    }

    let mut value = bytes as f64 / 1000.0;
    let mut unit = 0;
    while value >= 999.995 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    let decimals = match unit {
        0 => 0,
        1 => 1,
        _ => 2,
    };
    let text = format!("{value:.decimals$}");
    let text = if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    };
    format!("{text} {}", UNITS[unit])
}
