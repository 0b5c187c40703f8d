use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single external tool invocation.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("External tool missing: {program}")]
    NotFound { program: String },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {}s", .after.as_secs_f64())]
    Timeout { program: String, after: Duration },

    #[error("{program} exited with {}: {}", exit_label(.code), .stderr.trim())]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum MountError {
    #[error("Failed to read partition table of {}: {source}", .path.display())]
    InspectionFailed {
        path: PathBuf,
        #[source]
        source: CommandError,
    },

    #[error("No partitions found in {}", .path.display())]
    NoPartitionsFound { path: PathBuf },

    #[error("Failed to load kernel module {module}: {source}")]
    ModuleLoadFailed {
        module: String,
        #[source]
        source: CommandError,
    },

    #[error("Failed to connect {} to {}: {source}", .image.display(), .device.display())]
    AttachFailed {
        image: PathBuf,
        device: PathBuf,
        #[source]
        source: CommandError,
    },

    #[error("Failed to disconnect {}: {source}", .device.display())]
    DetachFailed {
        device: PathBuf,
        #[source]
        source: CommandError,
    },

    #[error("No free block device slot ({total} configured, all in use)")]
    NoFreeSlot { total: usize },

    #[error("Mount of {} at {} failed: {source}", .source_path.display(), .target.display())]
    MountFailed {
        source_path: PathBuf,
        target: PathBuf,
        #[source]
        source: CommandError,
    },

    #[error("Unmount of {} failed: {source}", .target.display())]
    UnmountFailed {
        target: PathBuf,
        #[source]
        source: CommandError,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Primary error of a failed operation together with any cleanup errors that
/// occurred while unwinding it.
#[derive(Debug)]
pub struct MountFailure {
    pub error: MountError,
    pub suppressed: Vec<MountError>,
}

impl MountFailure {
    pub fn new(error: MountError) -> Self {
        Self {
            error,
            suppressed: Vec::new(),
        }
    }

    pub fn with_suppressed(mut self, cleanup: MountError) -> Self {
        self.suppressed.push(cleanup);
        self
    }

    pub fn has_suppressed(&self) -> bool {
        !self.suppressed.is_empty()
    }
}

impl From<MountError> for MountFailure {
    fn from(error: MountError) -> Self {
        Self::new(error)
    }
}

impl fmt::Display for MountFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if !self.suppressed.is_empty() {
            write!(f, " ({} cleanup error(s) suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for MountFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_command_message_includes_stderr() {
        let err = CommandError::Failed {
            program: "umount".to_string(),
            code: Some(32),
            stderr: "umount: /mnt/a: not mounted.\n".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "umount exited with status 32: umount: /mnt/a: not mounted."
        );
    }

    #[test]
    fn test_failure_display_counts_suppressed_cleanup() {
        let failure = MountFailure::new(MountError::NoPartitionsFound {
            path: PathBuf::from("/dev/nbd0"),
        })
        .with_suppressed(MountError::NoFreeSlot { total: 1 });

        assert!(failure.has_suppressed());
        assert_eq!(
            failure.to_string(),
            "No partitions found in /dev/nbd0 (1 cleanup error(s) suppressed)"
        );
    }
}
