use crate::MountError;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fstype: String,
}

/// Read access to the OS mount table.
pub trait MountTable: Send + Sync {
    fn entries(&self) -> Result<Vec<MountEntry>, MountError>;

    /// Source currently mounted at `mount_point`. When mounts are stacked the
    /// topmost (last listed) one wins.
    fn source_of(&self, mount_point: &Path) -> Result<Option<PathBuf>, MountError> {
        let wanted = normalize(mount_point);
        Ok(self
            .entries()?
            .into_iter()
            .rev()
            .find(|entry| normalize(&entry.target) == wanted)
            .map(|entry| entry.source))
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}

/// Parses `/proc/mounts` formatted text. Malformed lines are skipped.
pub fn parse_mounts(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            Some(MountEntry {
                source: PathBuf::from(unescape(source)),
                target: PathBuf::from(unescape(target)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

// The kernel writes space, tab, newline and backslash as 3-digit octal escapes.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal(&bytes[i + 1..i + 4]) {
            let value =
                (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal(digits: &[u8]) -> bool {
    digits.len() == 3 && digits.iter().all(|d| (b'0'..=b'7').contains(d)) && digits[0] <= b'3'
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/sda2 / ext4 rw,relatime 0 0
/dev/loop3 /mnt/a ext4 rw,relatime 0 0
/dev/nbd0p1 /mnt/with\\040space ext4 rw,relatime 0 0
garbage
/dev/nbd0p1 /mnt/a ext4 rw,relatime 0 0
";

    struct Fixed(Vec<MountEntry>);

    impl MountTable for Fixed {
        fn entries(&self) -> Result<Vec<MountEntry>, MountError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_parses_and_unescapes_targets() {
        let entries = parse_mounts(MOUNTS);
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[3].target, PathBuf::from("/mnt/with space"));
        assert_eq!(entries[1].fstype, "ext4");
    }

    #[test]
    fn test_topmost_mount_wins() {
        let table = Fixed(parse_mounts(MOUNTS));
        assert_eq!(
            table.source_of(Path::new("/mnt/a/")).unwrap(),
            Some(PathBuf::from("/dev/nbd0p1"))
        );
        assert_eq!(table.source_of(Path::new("/mnt/b")).unwrap(), None);
    }

    #[test]
    fn test_lone_backslash_is_kept() {
        assert_eq!(unescape("a\\b"), "a\\b");
        assert_eq!(unescape("tail\\04"), "tail\\04");
        assert_eq!(unescape("x\\134y"), "x\\y");
    }
}
