use anyhow::{Result, anyhow, bail};
use blockgate_core::{OpenMode, StorageDeviceFile, StorageDeviceInfo, StorageDeviceService};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

mod flash;

#[derive(Parser)]
#[command(name = "blockgate")]
#[command(about = "Inspect USB storage devices and copy raw images to and from them", version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List USB storage devices with their partitions and mountpoints
    List,
    /// Write an image to a device, unmounting it first
    Write {
        /// Image file to write
        #[arg(required = true)]
        image: PathBuf,

        /// Device path to write to instead of choosing from a menu
        #[arg(short, long)]
        device: Option<String>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Skip write verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        /// Open the device through the platform's authorization prompt
        #[arg(long)]
        auth: bool,
    },
    /// Read a whole device into an image file
    Read {
        /// Output image file
        #[arg(required = true)]
        image: PathBuf,

        /// Device path to read from instead of choosing from a menu
        #[arg(short, long)]
        device: Option<String>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Picks a device by path, or presents an interactive menu.
fn select_device(
    devices: &[Arc<dyn StorageDeviceInfo>],
    requested: Option<&str>,
    prompt: &str,
) -> Result<Arc<dyn StorageDeviceInfo>> {
    if devices.is_empty() {
        bail!("No USB storage devices found.");
    }

    if let Some(path) = requested {
        return devices
            .iter()
            .find(|d| d.file_path() == path)
            .cloned()
            .ok_or_else(|| anyhow!("{path} is not an attached USB storage device."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(Arc::clone(&devices[selection]))
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

/// Unmounts and opens the device, explaining the usual causes on failure.
fn open_device(
    service: &StorageDeviceService,
    device: &Arc<dyn StorageDeviceInfo>,
    mode: OpenMode,
    auth: bool,
) -> Result<StorageDeviceFile> {
    let mut file = service.make_storage_device_file(device.file_path(), Arc::clone(device));
    let opened = if auth {
        file.auth_open(mode)
    } else {
        file.open(mode)
    };
    if !opened {
        bail!(
            "Could not open {}: a filesystem on it may be busy, or you may lack permission (run with -v for details).",
            device.file_path()
        );
    }
    Ok(file)
}

fn bar_style(color: &str) -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template(&format!(
            "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
        ))?
        .progress_chars("■ "))
}

fn list(service: &StorageDeviceService) {
    let devices = service.get_available_storage_devices();
    if devices.is_empty() {
        println!("No USB storage devices found.");
        return;
    }

    println!("Found {} USB storage devices:", devices.len());
    for device in &devices {
        println!("\n{}", style(device.to_string()).cyan());

        for mountpoint in device.mountpoints() {
            println!("  mounted at {}", mountpoint.fs_path());
        }

        let partitions = device.partitions();
        if partitions.is_empty() {
            println!("  (no partitions)");
        }
        for partition in partitions {
            let label = if partition.label().is_empty() {
                "(no label)".to_string()
            } else {
                partition.label().to_string()
            };
            println!("  {:<15} {}", partition.file_path(), label);

            let mountpoints = partition.mountpoints();
            if mountpoints.is_empty() {
                println!("    (not mounted)");
            }
            for mountpoint in mountpoints {
                println!("    mounted at {}", mountpoint.fs_path());
            }
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // This flag allows for graceful cancellation of operations.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    // Set up the Ctrl+C handler to toggle the `running` flag.
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let service = StorageDeviceService::new();

    match cli.command {
        Commands::List => list(&service),
        Commands::Write {
            image,
            device,
            yes,
            no_verify,
            auth,
        } => {
            let devices = service.get_available_storage_devices();
            let device = select_device(
                &devices,
                device.as_deref(),
                "Select the target device to WRITE to",
            )?;

            println!(
                "{} This will erase all data on {}.",
                style("WARNING:").red().bold(),
                style(device.to_string()).cyan(),
            );
            println!("  Image:  {}", style(image.display()).cyan());
            println!();

            if !yes && !confirm_operation("Are you sure you want to proceed?")? {
                println!("Write operation cancelled.");
                return Ok(());
            }

            let mode = if no_verify {
                OpenMode::WriteOnly
            } else {
                OpenMode::ReadWrite
            };
            let mut file = open_device(&service, &device, mode, auth)?;

            println!();

            let write_pb = ProgressBar::new(0);
            let verify_pb = if !no_verify {
                ProgressBar::new(0)
            } else {
                ProgressBar::hidden()
            };
            let write_style = bar_style("green")?;
            let verify_style = bar_style("magenta")?;

            let result = flash::write_image(
                &image,
                &mut file,
                !no_verify,
                &running,
                |len| {
                    write_pb.set_length(len);
                    write_pb.set_prefix("Writing");
                    write_pb.set_style(write_style);
                },
                |bytes| write_pb.set_position(bytes),
                |len| {
                    write_pb.finish_with_message("Write complete.");
                    verify_pb.set_length(len);
                    verify_pb.set_prefix("Verifying");
                    verify_pb.set_style(verify_style);
                },
                |bytes| verify_pb.set_position(bytes),
            );
            file.close();

            // Cleanly finish progress bars based on the result.
            match result {
                Ok(()) => {
                    if !no_verify {
                        verify_pb.finish_with_message("Verification successful.");
                    } else {
                        write_pb.finish_with_message("Write complete (verification skipped).");
                    }
                    println!(
                        "\n✨ Successfully flashed {} with {}.",
                        style(device.file_path()).cyan(),
                        style(image.display()).cyan()
                    );
                }
                Err(e) => {
                    write_pb.finish_and_clear();
                    verify_pb.finish_and_clear();
                    return Err(e);
                }
            }
        }
        Commands::Read { image, device, yes } => {
            let devices = service.get_available_storage_devices();
            let device = select_device(
                &devices,
                device.as_deref(),
                "Select the source device to READ from",
            )?;

            println!("This will copy all of {}.", style(device.to_string()).cyan());
            println!("  Output: {}", style(image.display()).cyan());
            println!();

            if !yes && !confirm_operation("Are you sure you want to proceed?")? {
                println!("Read operation cancelled.");
                return Ok(());
            }

            let mut file = open_device(&service, &device, OpenMode::ReadOnly, false)?;

            println!();

            let read_pb = ProgressBar::new(0);
            let read_style = bar_style("green")?;

            let result = flash::read_image(
                &mut file,
                &image,
                &running,
                |len| {
                    read_pb.set_length(len);
                    read_pb.set_prefix("Reading");
                    read_pb.set_style(read_style);
                },
                |bytes| read_pb.set_position(bytes),
            );
            file.close();

            match result {
                Ok(()) => {
                    read_pb.finish_with_message("Read complete.");
                    println!(
                        "\n✨ Successfully read {} to {}.",
                        style(device.file_path()).cyan(),
                        style(image.display()).cyan()
                    );
                }
                Err(e) => {
                    read_pb.finish_with_message("❌ Operation failed.");
                    return Err(e);
                }
            }
        }
    }

    Ok(())
}
