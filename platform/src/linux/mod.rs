pub mod fdisk;
pub mod mount_table;
pub mod mounter;
pub mod nbd;

pub use fdisk::{parse_fdisk_output, PartitionTableReader};
pub use mount_table::ProcMountTable;
pub use mounter::LinuxImageMounter;
pub use nbd::{NbdConnector, SlotAllocator};
