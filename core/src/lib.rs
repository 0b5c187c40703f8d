pub mod command;
pub mod config;
pub mod error;
pub mod image;
pub mod mount_table;
pub mod mounter;
pub mod partition;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use command::{CommandOutput, CommandRunner, CommandSpec};
pub use config::{MountConfig, ToolPaths};
pub use error::{CommandError, MountError, MountFailure};
pub use image::{
    is_container_image, Attachment, ImageKind, MountReport, MountRequest, UnmountReport,
};
pub use mount_table::{MountEntry, MountTable};
pub use mounter::ImageMounter;
pub use partition::{DegradedLine, Partition, PartitionTable, SECTOR_SIZE};
