use crate::{MountFailure, MountReport, MountRequest, PartitionTable, UnmountReport};
use std::path::Path;

#[async_trait::async_trait]
pub trait ImageMounter: Send + Sync {
    /// Mounts the first partition of `request.image` at `request.mount_point`.
    async fn mount(&self, request: &MountRequest) -> Result<MountReport, MountFailure>;

    /// Unmounts whatever is mounted at `mount_point`.
    async fn unmount(&self, mount_point: &Path) -> Result<UnmountReport, MountFailure>;

    /// Reads the partition table of an image without mounting anything.
    async fn inspect(&self, image: &Path) -> Result<PartitionTable, MountFailure>;
}
