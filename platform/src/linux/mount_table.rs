use diskmount_core::mount_table::parse_mounts;
use diskmount_core::{MountEntry, MountError, MountTable};
use std::fs;
use std::path::PathBuf;

/// The kernel's view of mounted filesystems, read from `/proc/mounts`.
pub struct ProcMountTable {
    path: PathBuf,
}

impl ProcMountTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MountTable for ProcMountTable {
    fn entries(&self) -> Result<Vec<MountEntry>, MountError> {
        let contents = fs::read_to_string(&self.path)?;
        Ok(parse_mounts(&contents))
    }
}
