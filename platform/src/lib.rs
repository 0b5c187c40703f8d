pub mod process;

#[cfg(target_os = "linux")]
pub mod linux;

pub use process::TokioCommandRunner;

#[cfg(target_os = "linux")]
pub use linux::LinuxImageMounter as PlatformImageMounter;
