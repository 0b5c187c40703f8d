use super::fdisk::PartitionTableReader;
use super::mount_table::ProcMountTable;
use super::nbd::NbdConnector;
use crate::process::TokioCommandRunner;
use diskmount_core::{
    Attachment, CommandRunner, CommandSpec, ImageKind, ImageMounter, MountConfig, MountError,
    MountFailure, MountReport, MountRequest, MountTable, Partition, PartitionTable, UnmountReport,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Mounts the first partition of a disk image: raw images through a loop
/// device at the partition's byte offset, container images through qemu-nbd.
///
/// Calls must be serialised by the caller. A successful container mount
/// leaves its device connected until [`ImageMounter::unmount`] detaches it.
pub struct LinuxImageMounter {
    config: MountConfig,
    runner: Arc<dyn CommandRunner>,
    reader: PartitionTableReader,
    connector: NbdConnector,
    mount_table: Arc<dyn MountTable>,
}

impl LinuxImageMounter {
    pub fn new(config: MountConfig) -> Self {
        let runner = Arc::new(TokioCommandRunner::with_timeout(config.command_timeout()));
        let mount_table = Arc::new(ProcMountTable::new(config.mount_table.clone()));
        Self::with_parts(config, runner, mount_table)
    }

    pub fn with_parts(
        config: MountConfig,
        runner: Arc<dyn CommandRunner>,
        mount_table: Arc<dyn MountTable>,
    ) -> Self {
        Self {
            reader: PartitionTableReader::new(runner.clone(), config.tools.fdisk.clone()),
            connector: NbdConnector::new(runner.clone(), &config),
            runner,
            mount_table,
            config,
        }
    }

    pub fn connector(&self) -> &NbdConnector {
        &self.connector
    }

    pub fn classify(&self, image: &Path) -> ImageKind {
        ImageKind::classify(image, &self.config.container_extension)
    }

    async fn mount_raw(&self, request: &MountRequest) -> Result<MountReport, MountFailure> {
        let table = self.reader.read_partitions(&request.image).await?;
        let partition = first_partition(&table, &request.image)?;

        let offset = partition.offset_bytes();
        let options = format!("loop,offset={},{}", offset, self.config.access_mode());
        let command = CommandSpec::new(&self.config.tools.mount)
            .args(["-t", self.config.filesystem_type.as_str(), "-o", options.as_str()])
            .path_arg(&request.image)
            .path_arg(&request.mount_point);

        self.runner
            .run_checked(&command)
            .await
            .map_err(|source| MountError::MountFailed {
                source_path: request.image.clone(),
                target: request.mount_point.clone(),
                source,
            })?;

        tracing::info!(
            "Mounted {} at {} (offset {})",
            request.image.display(),
            request.mount_point.display(),
            offset
        );

        Ok(MountReport {
            image: request.image.clone(),
            mount_point: request.mount_point.clone(),
            kind: ImageKind::Raw,
            source: request.image.clone(),
            offset: Some(offset),
            partition,
            device: None,
            degraded_lines: table.degraded.len(),
            mounted_at: chrono::Utc::now(),
        })
    }

    async fn mount_container(&self, request: &MountRequest) -> Result<MountReport, MountFailure> {
        let attachment = self.connector.attach(&request.image).await?;

        let table = match self.reader.read_partitions(&attachment.device).await {
            Ok(table) => table,
            Err(error) => return Err(self.unwind(&attachment, error).await),
        };
        let partition = match first_partition(&table, &request.image) {
            Ok(partition) => partition,
            Err(error) => return Err(self.unwind(&attachment, error).await),
        };

        let source = attachment.partition_device(&self.config.partition_suffix);
        let mut command = CommandSpec::new(&self.config.tools.mount)
            .args(["-t", self.config.filesystem_type.as_str()]);
        if self.config.read_only {
            command = command.args(["-o", "ro"]);
        }
        let command = command.path_arg(&source).path_arg(&request.mount_point);

        if let Err(cause) = self.runner.run_checked(&command).await {
            let error = MountError::MountFailed {
                source_path: source,
                target: request.mount_point.clone(),
                source: cause,
            };
            return Err(self.unwind(&attachment, error).await);
        }

        tracing::info!(
            "Mounted {} at {} via {}",
            request.image.display(),
            request.mount_point.display(),
            source.display()
        );

        Ok(MountReport {
            image: request.image.clone(),
            mount_point: request.mount_point.clone(),
            kind: ImageKind::Container,
            source,
            offset: None,
            partition,
            device: Some(attachment.device),
            degraded_lines: table.degraded.len(),
            mounted_at: chrono::Utc::now(),
        })
    }

    /// Disconnects `attachment` after `error`. A disconnect failure is kept
    /// alongside the original error instead of replacing it.
    async fn unwind(&self, attachment: &Attachment, error: MountError) -> MountFailure {
        let failure = MountFailure::new(error);
        match self.connector.detach(&attachment.device).await {
            Ok(()) => failure,
            Err(cleanup) => {
                tracing::warn!(
                    "Cleanup failed, {} may still be connected: {}",
                    attachment.device.display(),
                    cleanup
                );
                failure.with_suppressed(cleanup)
            }
        }
    }

    fn mounted_source(&self, mount_point: &Path) -> Option<PathBuf> {
        let target = absolute_mount_point(mount_point);
        match self.mount_table.source_of(&target) {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!("Cannot read mount table, no device will be detached: {}", e);
                None
            }
        }
    }
}

fn first_partition(table: &PartitionTable, image: &Path) -> Result<Partition, MountError> {
    table
        .first()
        .cloned()
        .ok_or_else(|| MountError::NoPartitionsFound {
            path: image.to_path_buf(),
        })
}

/// The mount table lists absolute targets, so relative mount points are
/// resolved first. Canonicalizing only works while the mount still exists.
fn absolute_mount_point(mount_point: &Path) -> PathBuf {
    if let Ok(resolved) = fs::canonicalize(mount_point) {
        return resolved;
    }
    if mount_point.is_absolute() {
        return mount_point.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(mount_point),
        Err(e) => {
            tracing::debug!("Cannot resolve {}: {}", mount_point.display(), e);
            mount_point.to_path_buf()
        }
    }
}

fn warn_if_unprivileged() {
    if !nix::unistd::geteuid().is_root() {
        tracing::warn!("Not running as root; mount and qemu-nbd will most likely be refused");
    }
}

#[async_trait::async_trait]
impl ImageMounter for LinuxImageMounter {
    async fn mount(&self, request: &MountRequest) -> Result<MountReport, MountFailure> {
        warn_if_unprivileged();
        let kind = self.classify(&request.image);
        tracing::debug!("{} classified as {:?}", request.image.display(), kind);

        match kind {
            ImageKind::Raw => self.mount_raw(request).await,
            ImageKind::Container => self.mount_container(request).await,
        }
    }

    async fn unmount(&self, mount_point: &Path) -> Result<UnmountReport, MountFailure> {
        warn_if_unprivileged();
        let source = self.mounted_source(mount_point);

        let command = CommandSpec::new(&self.config.tools.umount).path_arg(mount_point);
        self.runner
            .run_checked(&command)
            .await
            .map_err(|source| MountError::UnmountFailed {
                target: mount_point.to_path_buf(),
                source,
            })?;
        tracing::info!("Unmounted {}", mount_point.display());

        let slot = source
            .as_deref()
            .and_then(|source| self.connector.slots().slot_for(source))
            .filter(|_| self.config.detach_on_unmount);

        if let Some(device) = &slot {
            self.connector.detach(device).await?;
        }

        Ok(UnmountReport {
            mount_point: mount_point.to_path_buf(),
            source,
            detached: slot,
            unmounted_at: chrono::Utc::now(),
        })
    }

    async fn inspect(&self, image: &Path) -> Result<PartitionTable, MountFailure> {
        match self.classify(image) {
            ImageKind::Raw => Ok(self.reader.read_partitions(image).await?),
            ImageKind::Container => {
                let attachment = self.connector.attach(image).await?;
                match self.reader.read_partitions(&attachment.device).await {
                    Ok(table) => {
                        self.connector.detach(&attachment.device).await?;
                        Ok(table)
                    }
                    Err(error) => Err(self.unwind(&attachment, error).await),
                }
            }
        }
    }
}
