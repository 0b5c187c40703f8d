use crate::partition::Partition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Extension of the only container format the connector knows how to expose.
pub const CONTAINER_EXTENSION: &str = "vdi";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImageKind {
    /// Sector-for-sector disk copy, mountable through a loop device with an offset.
    Raw,
    /// Structured container that must be exposed as a block device first.
    Container,
}

impl ImageKind {
    /// Classifies by file name only. A container image with the wrong extension
    /// is treated as raw.
    pub fn classify(path: &Path, container_extension: &str) -> Self {
        let is_container = path
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(container_extension))
            .unwrap_or(false);

        if is_container {
            ImageKind::Container
        } else {
            ImageKind::Raw
        }
    }
}

pub fn is_container_image(path: &Path) -> bool {
    ImageKind::classify(path, CONTAINER_EXTENSION) == ImageKind::Container
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRequest {
    pub image: PathBuf,
    pub mount_point: PathBuf,
}

impl MountRequest {
    pub fn new(image: impl Into<PathBuf>, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            mount_point: mount_point.into(),
        }
    }
}

/// An image bound to a network block device node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub device: PathBuf,
    pub image: PathBuf,
}

impl Attachment {
    /// Node of a partition on the attached device, e.g. `/dev/nbd0` + `p1`.
    pub fn partition_device(&self, suffix: &str) -> PathBuf {
        let mut node = self.device.clone().into_os_string();
        node.push(suffix);
        PathBuf::from(node)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountReport {
    pub image: PathBuf,
    pub mount_point: PathBuf,
    pub kind: ImageKind,
    /// What was handed to mount: the image file or a partition device node.
    pub source: PathBuf,
    pub offset: Option<u64>,
    pub partition: Partition,
    pub device: Option<PathBuf>,
    pub degraded_lines: usize,
    pub mounted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmountReport {
    pub mount_point: PathBuf,
    pub source: Option<PathBuf>,
    pub detached: Option<PathBuf>,
    pub unmounted_at: DateTime<Utc>,
}
