use diskmount_core::{Attachment, CommandRunner, CommandSpec, MountConfig, MountError};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Pool of network block device nodes an image may be bound to.
///
/// A slot is free when this process has not handed it out and the kernel
/// reports the device as empty (`/sys/block/<name>/size` missing or zero).
pub struct SlotAllocator {
    slots: Vec<PathBuf>,
    in_use: Mutex<HashSet<PathBuf>>,
    sysfs_block_dir: PathBuf,
}

impl SlotAllocator {
    pub fn new(slots: Vec<PathBuf>, sysfs_block_dir: impl Into<PathBuf>) -> Self {
        Self {
            slots,
            in_use: Mutex::new(HashSet::new()),
            sysfs_block_dir: sysfs_block_dir.into(),
        }
    }

    pub fn from_config(config: &MountConfig) -> Self {
        Self::new(config.nbd_devices.clone(), config.sysfs_block_dir.clone())
    }

    pub fn allocate(&self) -> Result<PathBuf, MountError> {
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);

        for slot in &self.slots {
            if in_use.contains(slot) {
                continue;
            }
            if self.kernel_busy(slot) {
                tracing::debug!("{} is already connected, skipping", slot.display());
                continue;
            }
            in_use.insert(slot.clone());
            return Ok(slot.clone());
        }

        Err(MountError::NoFreeSlot {
            total: self.slots.len(),
        })
    }

    /// Returns `device` to the pool. Returns false if it was not handed out.
    pub fn release(&self, device: &Path) -> bool {
        self.in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device)
    }

    pub fn is_allocated(&self, device: &Path) -> bool {
        self.in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(device)
    }

    /// Slot backing `source`, where `source` is the slot itself or one of its
    /// partition nodes (`/dev/nbd0`, `/dev/nbd0p1`).
    pub fn slot_for(&self, source: &Path) -> Option<PathBuf> {
        let source = source.to_string_lossy();
        self.slots
            .iter()
            .find(|slot| {
                let slot = slot.to_string_lossy();
                source
                    .strip_prefix(&*slot)
                    .map(is_partition_suffix)
                    .unwrap_or(false)
            })
            .cloned()
    }

    fn kernel_busy(&self, device: &Path) -> bool {
        let Some(name) = device.file_name() else {
            return false;
        };
        fs::read_to_string(self.sysfs_block_dir.join(name).join("size"))
            .ok()
            .and_then(|size| size.trim().parse::<u64>().ok())
            .map(|sectors| sectors > 0)
            .unwrap_or(false)
    }
}

fn is_partition_suffix(rest: &str) -> bool {
    match rest.strip_prefix('p') {
        Some(index) => !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()),
        None => rest.is_empty(),
    }
}

/// Exposes container images as block devices through qemu-nbd.
pub struct NbdConnector {
    runner: Arc<dyn CommandRunner>,
    slots: SlotAllocator,
    module: String,
    module_params: Vec<String>,
    modprobe: String,
    qemu_nbd: String,
}

impl NbdConnector {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &MountConfig) -> Self {
        Self {
            runner,
            slots: SlotAllocator::from_config(config),
            module: config.nbd_module.clone(),
            module_params: config.nbd_module_params.clone(),
            modprobe: config.tools.modprobe.clone(),
            qemu_nbd: config.tools.qemu_nbd.clone(),
        }
    }

    pub fn slots(&self) -> &SlotAllocator {
        &self.slots
    }

    pub async fn attach(&self, image: &Path) -> Result<Attachment, MountError> {
        self.load_module().await?;

        let device = self.slots.allocate()?;
        let command = CommandSpec::new(&self.qemu_nbd)
            .arg("-c")
            .path_arg(&device)
            .path_arg(image);

        if let Err(source) = self.runner.run_checked(&command).await {
            self.slots.release(&device);
            return Err(MountError::AttachFailed {
                image: image.to_path_buf(),
                device,
                source,
            });
        }

        tracing::info!("Connected {} to {}", image.display(), device.display());
        Ok(Attachment {
            device,
            image: image.to_path_buf(),
        })
    }

    /// Disconnects `device`. The slot stays reserved if the disconnect fails.
    pub async fn detach(&self, device: &Path) -> Result<(), MountError> {
        let command = CommandSpec::new(&self.qemu_nbd).arg("-d").path_arg(device);

        self.runner
            .run_checked(&command)
            .await
            .map_err(|source| MountError::DetachFailed {
                device: device.to_path_buf(),
                source,
            })?;

        self.slots.release(device);
        tracing::info!("Disconnected {}", device.display());
        Ok(())
    }

    async fn load_module(&self) -> Result<(), MountError> {
        let command = CommandSpec::new(&self.modprobe)
            .arg(&self.module)
            .args(self.module_params.iter().cloned());

        self.runner
            .run_checked(&command)
            .await
            .map_err(|source| MountError::ModuleLoadFailed {
                module: self.module.clone(),
                source,
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskmount_core::test_utils::MockCommandRunner;
    use diskmount_core::CommandOutput;

    fn allocator(slots: &[&str], sysfs: &Path) -> SlotAllocator {
        SlotAllocator::new(slots.iter().map(PathBuf::from).collect(), sysfs)
    }

    fn write_size(sysfs: &Path, name: &str, size: &str) {
        let dir = sysfs.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("size"), size).unwrap();
    }

    #[test]
    fn test_single_slot_is_exclusive_until_released() {
        let sysfs = tempfile::tempdir().unwrap();
        let slots = allocator(&["/dev/nbd0"], sysfs.path());

        let first = slots.allocate().unwrap();
        assert_eq!(first, PathBuf::from("/dev/nbd0"));
        assert!(matches!(slots.allocate(), Err(MountError::NoFreeSlot { total: 1 })));

        assert!(slots.release(&first));
        assert!(!slots.release(&first));
        assert_eq!(slots.allocate().unwrap(), first);
    }

    #[test]
    fn test_kernel_busy_slots_are_skipped() {
        let sysfs = tempfile::tempdir().unwrap();
        write_size(sysfs.path(), "nbd0", "2097152\n");
        write_size(sysfs.path(), "nbd1", "0\n");
        let slots = allocator(&["/dev/nbd0", "/dev/nbd1"], sysfs.path());

        assert_eq!(slots.allocate().unwrap(), PathBuf::from("/dev/nbd1"));
        assert!(slots.is_allocated(Path::new("/dev/nbd1")));
        assert!(!slots.is_allocated(Path::new("/dev/nbd0")));
    }

    #[test]
    fn test_slot_for_matches_device_and_its_partitions() {
        let sysfs = tempfile::tempdir().unwrap();
        let slots = allocator(&["/dev/nbd1", "/dev/nbd10"], sysfs.path());

        assert_eq!(slots.slot_for(Path::new("/dev/nbd1p1")), Some(PathBuf::from("/dev/nbd1")));
        assert_eq!(slots.slot_for(Path::new("/dev/nbd10p2")), Some(PathBuf::from("/dev/nbd10")));
        assert_eq!(slots.slot_for(Path::new("/dev/nbd1")), Some(PathBuf::from("/dev/nbd1")));
        assert_eq!(slots.slot_for(Path::new("/dev/nbd11p1")), None);
        assert_eq!(slots.slot_for(Path::new("/dev/nbd1p")), None);
        assert_eq!(slots.slot_for(Path::new("/dev/loop0")), None);
    }

    fn test_config(sysfs: &Path) -> MountConfig {
        MountConfig {
            sysfs_block_dir: sysfs.to_path_buf(),
            ..MountConfig::default()
        }
    }

    #[tokio::test]
    async fn test_attach_loads_module_then_connects() {
        let sysfs = tempfile::tempdir().unwrap();
        let runner = MockCommandRunner::new();
        let connector = NbdConnector::new(Arc::new(runner.clone()), &test_config(sysfs.path()));

        let attachment = connector.attach(Path::new("disk.vdi")).await.unwrap();
        assert_eq!(attachment.device, PathBuf::from("/dev/nbd0"));

        let calls = runner.calls();
        assert_eq!(calls[0].to_string(), "modprobe nbd max_part=16");
        assert_eq!(calls[1].to_string(), "qemu-nbd -c /dev/nbd0 disk.vdi");
    }

    #[tokio::test]
    async fn test_module_failure_stops_before_connect() {
        let sysfs = tempfile::tempdir().unwrap();
        let runner = MockCommandRunner::new().respond(
            "modprobe",
            CommandOutput::failure(1, "modprobe: FATAL: Module nbd not found"),
        );
        let connector = NbdConnector::new(Arc::new(runner.clone()), &test_config(sysfs.path()));

        let err = connector.attach(Path::new("disk.vdi")).await.unwrap_err();
        assert!(matches!(err, MountError::ModuleLoadFailed { .. }));
        assert!(err.to_string().contains("Module nbd not found"));
        assert!(runner.calls_to("qemu-nbd").is_empty());
    }

    #[tokio::test]
    async fn test_failed_connect_releases_slot() {
        let sysfs = tempfile::tempdir().unwrap();
        let runner = MockCommandRunner::new()
            .respond("qemu-nbd", CommandOutput::failure(1, "Failed to open /dev/nbd0"));
        let connector = NbdConnector::new(Arc::new(runner.clone()), &test_config(sysfs.path()));

        let err = connector.attach(Path::new("disk.vdi")).await.unwrap_err();
        assert!(matches!(err, MountError::AttachFailed { .. }));
        assert!(err.to_string().contains("Failed to open /dev/nbd0"));
        assert!(!connector.slots().is_allocated(Path::new("/dev/nbd0")));
    }

    #[tokio::test]
    async fn test_detach_frees_slot_only_on_success() {
        let sysfs = tempfile::tempdir().unwrap();
        let runner = MockCommandRunner::new()
            .respond_with_arg("qemu-nbd", "-d", CommandOutput::failure(1, "device busy"));
        let connector = NbdConnector::new(Arc::new(runner.clone()), &test_config(sysfs.path()));

        let attachment = connector.attach(Path::new("disk.vdi")).await.unwrap();
        let err = connector.detach(&attachment.device).await.unwrap_err();
        assert!(matches!(err, MountError::DetachFailed { .. }));
        assert!(connector.slots().is_allocated(&attachment.device));
    }
}
