use crate::MountError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR: &str = "diskmount";
const CONFIG_FILE: &str = "config.json";

/// Names of the external programs the mounter drives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolPaths {
    pub fdisk: String,
    pub mount: String,
    pub umount: String,
    pub modprobe: String,
    pub qemu_nbd: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            fdisk: "fdisk".to_string(),
            mount: "mount".to_string(),
            umount: "umount".to_string(),
            modprobe: "modprobe".to_string(),
            qemu_nbd: "qemu-nbd".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MountConfig {
    pub filesystem_type: String,
    pub container_extension: String,
    pub read_only: bool,
    pub nbd_module: String,
    pub nbd_module_params: Vec<String>,
    /// Block device slots the connector may bind images to.
    pub nbd_devices: Vec<PathBuf>,
    pub partition_suffix: String,
    pub sysfs_block_dir: PathBuf,
    pub mount_table: PathBuf,
    pub detach_on_unmount: bool,
    pub command_timeout_secs: Option<u64>,
    pub tools: ToolPaths,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            filesystem_type: "ext4".to_string(),
            container_extension: crate::image::CONTAINER_EXTENSION.to_string(),
            read_only: false,
            nbd_module: "nbd".to_string(),
            nbd_module_params: vec!["max_part=16".to_string()],
            nbd_devices: vec![PathBuf::from("/dev/nbd0")],
            partition_suffix: "p1".to_string(),
            sysfs_block_dir: PathBuf::from("/sys/block"),
            mount_table: PathBuf::from("/proc/mounts"),
            detach_on_unmount: true,
            command_timeout_secs: None,
            tools: ToolPaths::default(),
        }
    }
}

impl MountConfig {
    /// `<config dir>/diskmount/config.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Loads an explicit file, or the default file when it exists, or the
    /// built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, MountError> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, MountError> {
        tracing::debug!(path = %path.display(), "loading configuration");
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MountError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn validate(&self) -> Result<(), MountError> {
        if self.filesystem_type.trim().is_empty() {
            return Err(MountError::Configuration("filesystem_type is empty".to_string()));
        }
        if self.container_extension.trim().is_empty() {
            return Err(MountError::Configuration("container_extension is empty".to_string()));
        }
        if self.nbd_devices.is_empty() {
            return Err(MountError::Configuration("nbd_devices lists no slots".to_string()));
        }
        if self.partition_suffix.is_empty() {
            return Err(MountError::Configuration("partition_suffix is empty".to_string()));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }

    /// Access mode passed in mount options.
    pub fn access_mode(&self) -> &'static str {
        if self.read_only {
            "ro"
        } else {
            "rw"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_use_single_slot_and_ext4() {
        let config = MountConfig::default();
        assert_eq!(config.filesystem_type, "ext4");
        assert_eq!(config.nbd_devices, vec![PathBuf::from("/dev/nbd0")]);
        assert_eq!(config.access_mode(), "rw");
        assert!(config.command_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_remaining_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"read_only": true, "nbd_devices": ["/dev/nbd3", "/dev/nbd4"], "command_timeout_secs": 30}}"#
        )
        .unwrap();

        let config = MountConfig::load(Some(file.path())).unwrap();
        assert!(config.read_only);
        assert_eq!(config.nbd_devices.len(), 2);
        assert_eq!(config.command_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.tools.qemu_nbd, "qemu-nbd");
        assert_eq!(config.partition_suffix, "p1");
    }

    #[test]
    fn test_empty_slot_list_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"nbd_devices": []}}"#).unwrap();

        let err = MountConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, MountError::Configuration(_)));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = MountConfig::load(Some(&dir.path().join("absent.json"))).unwrap_err();
        assert!(matches!(err, MountError::Configuration(_)));
    }

    #[test]
    fn test_malformed_file_is_a_serialization_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        let err = MountConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, MountError::SerializationError(_)));
    }
}
