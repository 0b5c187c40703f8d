/// Test utilities and mock implementations for safe testing
use crate::{
    CommandError, CommandOutput, CommandRunner, CommandSpec, MountEntry, MountError, MountTable,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug)]
enum Scripted {
    Output(CommandOutput),
    NotFound,
    Timeout(Duration),
}

#[derive(Clone, Debug)]
struct Rule {
    program: String,
    arg: Option<String>,
    response: Scripted,
}

impl Rule {
    fn matches(&self, command: &CommandSpec) -> bool {
        self.program == command.program
            && self.arg.as_deref().map_or(true, |arg| command.has_arg(arg))
    }
}

/// Command runner that never spawns anything. Every invocation is recorded;
/// responses come from the first matching rule, or an empty success.
#[derive(Clone, Default)]
pub struct MockCommandRunner {
    rules: Vec<Rule>,
    calls: Arc<Mutex<Vec<CommandSpec>>>,
}

impl MockCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every call to `program` with `output`.
    pub fn respond(self, program: &str, output: CommandOutput) -> Self {
        self.push_rule(program, None, Scripted::Output(output))
    }

    /// Answers calls to `program` that carry `arg` with `output`.
    pub fn respond_with_arg(self, program: &str, arg: &str, output: CommandOutput) -> Self {
        self.push_rule(program, Some(arg), Scripted::Output(output))
    }

    pub fn missing(self, program: &str) -> Self {
        self.push_rule(program, None, Scripted::NotFound)
    }

    pub fn hangs(self, program: &str, after: Duration) -> Self {
        self.push_rule(program, None, Scripted::Timeout(after))
    }

    fn push_rule(mut self, program: &str, arg: Option<&str>, response: Scripted) -> Self {
        self.rules.push(Rule {
            program: program.to_string(),
            arg: arg.map(str::to_string),
            response,
        });
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    pub fn call_count(&self, program: &str, arg: &str) -> usize {
        self.calls_to(program)
            .iter()
            .filter(|c| c.has_arg(arg))
            .count()
    }
}

#[async_trait::async_trait]
impl CommandRunner for MockCommandRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, CommandError> {
        self.calls.lock().unwrap().push(command.clone());

        let response = self
            .rules
            .iter()
            .find(|rule| rule.matches(command))
            .map(|rule| rule.response.clone())
            .unwrap_or_else(|| Scripted::Output(CommandOutput::success("")));

        match response {
            Scripted::Output(output) => Ok(output),
            Scripted::NotFound => Err(CommandError::NotFound {
                program: command.program.clone(),
            }),
            Scripted::Timeout(after) => Err(CommandError::Timeout {
                program: command.program.clone(),
                after,
            }),
        }
    }
}

/// Mount table backed by a fixed list of entries
#[derive(Clone, Default)]
pub struct MockMountTable {
    entries: Vec<MountEntry>,
    unreadable: bool,
}

impl MockMountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mount(mut self, source: &str, target: &str) -> Self {
        self.entries.push(MountEntry {
            source: PathBuf::from(source),
            target: PathBuf::from(target),
            fstype: "ext4".to_string(),
        });
        self
    }

    pub fn unreadable() -> Self {
        Self {
            entries: Vec::new(),
            unreadable: true,
        }
    }
}

impl MountTable for MockMountTable {
    fn entries(&self) -> Result<Vec<MountEntry>, MountError> {
        if self.unreadable {
            return Err(MountError::IoError(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "mock mount table is unreadable",
            )));
        }
        Ok(self.entries.clone())
    }
}

/// `fdisk -l` output for a raw image with one Linux partition at sector 2048.
pub const FDISK_SINGLE_PARTITION: &str = "\
Disk a.img: 100 MiB, 104857600 bytes, 204800 sectors
Units: sectors of 1 * 512 = 512 bytes
Sector size (logical/physical): 512 bytes / 512 bytes
I/O size (minimum/optimal): 512 bytes / 512 bytes
Disklabel type: dos
Disk identifier: 0x6e1e3f8c

Device     Boot Start    End Sectors Size Id Type
a.img1           2048 204799  202752  99M 83 Linux
";

/// Same layout as seen through the network block device.
pub const FDISK_NBD_PARTITION: &str = "\
Disk /dev/nbd0: 1 GiB, 1073741824 bytes, 2097152 sectors
Units: sectors of 1 * 512 = 512 bytes
Disklabel type: dos

Device      Boot Start     End Sectors  Size Id Type
/dev/nbd0p1       2048 2097151 2095104 1023M 83 Linux
";

/// A disk with a label but no partitions.
pub const FDISK_NO_PARTITIONS: &str = "\
Disk empty.img: 10 MiB, 10485760 bytes, 20480 sectors
Units: sectors of 1 * 512 = 512 bytes
Disklabel type: dos
Disk identifier: 0x00000000
";
