use diskmount_core::{
    CommandRunner, CommandSpec, DegradedLine, MountError, Partition, PartitionTable,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::sync::Arc;

// Device column ending in a digit, optional boot flag, start, end, sectors,
// then any descriptive columns and a trailing type word.
static PARTITION_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<device>\S*\d)\s+(?:\*\s+)?(?P<start>\S+)\s+(?P<end>\S+)\s+(?P<sectors>\S+)\s+(?:.*\s)?(?P<kind>\w+)\s*$",
    )
    .expect("partition line pattern is valid")
});

/// Extracts partitions from `fdisk -l` output. Lines that do not look like a
/// partition row are ignored; rows with unreadable numbers are kept with the
/// field read as zero and listed in `degraded`.
pub fn parse_fdisk_output(output: &str) -> PartitionTable {
    let mut table = PartitionTable::default();

    for (index, line) in output.lines().enumerate() {
        let Some(caps) = PARTITION_LINE.captures(line) else {
            continue;
        };

        let mut bad_fields = Vec::new();
        let mut number = |name: &str| -> u64 {
            caps[name].parse::<u64>().unwrap_or_else(|_| {
                bad_fields.push(name.to_string());
                0
            })
        };
        let start_sector = number("start");
        let sectors = number("sectors");

        table.partitions.push(Partition::new(
            &caps["device"],
            start_sector,
            sectors,
            &caps["kind"],
        ));

        if !bad_fields.is_empty() {
            table.degraded.push(DegradedLine {
                line_number: index + 1,
                text: line.to_string(),
                fields: bad_fields,
            });
        }
    }

    table
}

/// Reads partition tables by running fdisk against an image file or block device.
pub struct PartitionTableReader {
    runner: Arc<dyn CommandRunner>,
    fdisk: String,
}

impl PartitionTableReader {
    pub fn new(runner: Arc<dyn CommandRunner>, fdisk: impl Into<String>) -> Self {
        Self {
            runner,
            fdisk: fdisk.into(),
        }
    }

    pub async fn read_partitions(&self, path: &Path) -> Result<PartitionTable, MountError> {
        let command = CommandSpec::new(&self.fdisk)
            .arg("-l")
            .path_arg(path)
            .env("LC_ALL", "C");

        let output = self
            .runner
            .run_checked(&command)
            .await
            .map_err(|source| MountError::InspectionFailed {
                path: path.to_path_buf(),
                source,
            })?;

        let table = parse_fdisk_output(&output.stdout);
        for line in &table.degraded {
            tracing::warn!(
                "Unreadable {} on fdisk line {} ({:?}), treated as 0",
                line.fields.join(", "),
                line.line_number,
                line.text
            );
        }
        tracing::debug!("Found {} partition(s) on {}", table.len(), path.display());

        Ok(table)
    }
}
