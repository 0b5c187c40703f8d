use serde::{Deserialize, Serialize};

/// Sector size assumed for every partition table this crate reads.
pub const SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Identifier column as printed by the inspection tool (e.g. `/dev/nbd0p1`).
    pub device: String,
    pub start_sector: u64,
    pub size_bytes: u64,
    pub partition_type: String,
}

impl Partition {
    pub fn new(
        device: impl Into<String>,
        start_sector: u64,
        sectors: u64,
        partition_type: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            start_sector,
            size_bytes: sectors.saturating_mul(SECTOR_SIZE),
            partition_type: partition_type.into(),
        }
    }

    /// Byte offset of the partition inside the image, used for loop mounts.
    pub fn offset_bytes(&self) -> u64 {
        self.start_sector.saturating_mul(SECTOR_SIZE)
    }
}

/// A line that matched the partition pattern but carried an unparsable numeric field.
/// The affected fields were read as zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedLine {
    pub line_number: usize,
    pub text: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTable {
    pub partitions: Vec<Partition>,
    pub degraded: Vec<DegradedLine>,
}

impl PartitionTable {
    pub fn first(&self) -> Option<&Partition> {
        self.partitions.first()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }
}
