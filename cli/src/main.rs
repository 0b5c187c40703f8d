use clap::{Parser, Subcommand};
use diskmount_core::{ImageMounter, MountConfig, MountFailure, MountRequest};
use diskmount_platform::PlatformImageMounter;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "diskmount")]
#[command(about = "Mount the first partition of a raw or VDI disk image", long_about = None)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Give up on any external tool after this many seconds
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the first partition of an image
    Mount {
        image: PathBuf,
        mount_point: PathBuf,
        /// Mount read-only
        #[arg(long)]
        read_only: bool,
    },
    /// Unmount a mount point, disconnecting its block device if it has one
    #[command(alias = "unmount")]
    Umount {
        mount_point: PathBuf,
        /// Leave an nbd device connected after unmounting
        #[arg(long)]
        keep_attached: bool,
    },
    /// Show the partition table of an image
    Inspect { image: PathBuf },
}

fn init_tracing(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn report_suppressed(failure: &MountFailure) {
    for cleanup in &failure.suppressed {
        eprintln!("  cleanup also failed: {}", cleanup);
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if let Err(error) = run(cli).await {
        tracing::debug!("Command failed: {:?}", error);
        eprintln!("Error: {}", error);
        if let Some(failure) = error.downcast_ref::<MountFailure>() {
            report_suppressed(failure);
        }
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = MountConfig::load(cli.config.as_deref())?;
    match &cli.config {
        Some(path) => tracing::debug!("Loaded configuration from {}", path.display()),
        None => tracing::debug!("Using default configuration locations"),
    }
    if cli.timeout.is_some() {
        config.command_timeout_secs = cli.timeout;
        tracing::debug!("Tool timeout overridden to {:?}", config.command_timeout());
    }

    match cli.command {
        Commands::Mount {
            image,
            mount_point,
            read_only,
        } => {
            config.read_only |= read_only;
            let mounter = PlatformImageMounter::new(config);
            let report = mounter.mount(&MountRequest::new(image, mount_point)).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Mounted {} at {}",
                    report.image.display(),
                    report.mount_point.display()
                );
                if report.degraded_lines > 0 {
                    println!(
                        "  ({} partition line(s) could not be fully parsed)",
                        report.degraded_lines
                    );
                }
            }
        }
        Commands::Umount {
            mount_point,
            keep_attached,
        } => {
            if keep_attached {
                config.detach_on_unmount = false;
            }
            let mounter = PlatformImageMounter::new(config);
            let report = mounter.unmount(&mount_point).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Unmounted {}", report.mount_point.display());
                if let Some(device) = &report.detached {
                    println!("  Disconnected {}", device.display());
                }
            }
        }
        Commands::Inspect { image } => {
            let mounter = PlatformImageMounter::new(config);
            let table = mounter.inspect(&image).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&table)?);
            } else if table.is_empty() {
                println!("No partitions found in {}", image.display());
            } else {
                println!("Partitions in {}:\n", image.display());
                for (index, partition) in table.partitions.iter().enumerate() {
                    println!("  #{} {}", index + 1, partition.device);
                    println!("    Start sector: {}", partition.start_sector);
                    println!("    Offset: {} bytes", partition.offset_bytes());
                    println!("    Size: {:.2} MB", partition.size_bytes as f64 / 1_048_576.0);
                    println!("    Type: {}", partition.partition_type);
                }
                for line in &table.degraded {
                    println!(
                        "  warning: line {} unreadable ({})",
                        line.line_number,
                        line.fields.join(", ")
                    );
                }
            }
        }
    }

    Ok(())
}
