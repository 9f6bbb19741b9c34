mod bars;
mod logger;

use anyhow::{Context, Result, anyhow, bail};
use bars::StageBars;
use clap::{ArgAction, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use log::{info, warn};
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use stickr_core::block::BlockDevice;
use stickr_core::enumerate::{self, MassStorageCandidate};
use stickr_core::flash::{self, FlashOptions};
use stickr_core::image::{Compression, ImageSource};
use stickr_core::mbr::{self, PartitionEntry, SECTOR_SIZE, TYPE_EFI_SYSTEM};
use stickr_core::package::Payloads;
use stickr_core::platform::{self, KernelDisk, LinuxUsbHost};
use stickr_core::progress::FlashProgress;
use stickr_core::stream::DEFAULT_CHUNK_SIZE;
use stickr_core::usb::{DeviceId, UsbHost};
use stickr_core::usb::mass_storage::MassStorageDevice;
use stickr_core::{FlashError, Outcome, install};

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "stickr")]
#[command(about = "Flash images and Ventoy layouts straight onto USB sticks", version)]
struct Cli {
    /// Increase log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a whole-disk image to a USB stick interactively
    Flash {
        /// Image file to write (.img, .iso, optionally .gz/.xz/.zst)
        #[arg(required = true)]
        image: PathBuf,

        /// Skip read-back verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        /// Bytes per device write, e.g. 1M or 256K
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, value_parser = parse_size)]
        chunk_size: usize,
    },
    /// Install a Ventoy layout from an unpacked release directory
    Install {
        /// Directory holding boot/boot.img, boot/core.img.xz and ventoy/ventoy.disk.img.xz
        #[arg(required = true)]
        package: PathBuf,
    },
    /// List attached USB mass-storage devices
    List,
}

/// Parses a byte count with an optional `K`, `M` or `G` suffix.
fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let (digits, shift) = match s.char_indices().last() {
        Some((i, 'k' | 'K')) => (&s[..i], 10),
        Some((i, 'm' | 'M')) => (&s[..i], 20),
        Some((i, 'g' | 'G')) => (&s[..i], 30),
        _ => (s, 0),
    };
    let n: usize = digits
        .parse()
        .map_err(|_| format!("'{s}' is not a size"))?;
    let size = n
        .checked_mul(1 << shift)
        .ok_or_else(|| format!("'{s}' is too large"))?;
    if size == 0 {
        return Err("size must be greater than zero".to_string());
    }
    Ok(size)
}

/// On Unix, disables `ECHOCTL` so Ctrl+C is not echoed as `^C` while bars
/// are drawn. The original terminal state is restored on drop.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }
            let fd = stdout().as_raw_fd();
            let original_termios = Termios::from_fd(fd).ok().filter(|original| {
                let mut quiet = *original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).is_ok()
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

fn list_sticks(host: &LinuxUsbHost) -> Result<Vec<MassStorageCandidate>> {
    enumerate::list_candidates(host).context("Failed to scan USB devices")
}

/// Presents an interactive menu for the user to select a stick.
fn select_device(candidates: &[MassStorageCandidate], prompt: &str) -> Result<MassStorageCandidate> {
    if candidates.is_empty() {
        return Err(anyhow!("No USB mass-storage devices found."));
    }

    let items: Vec<String> = candidates.iter().map(|c| c.summary().to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(candidates[selection].clone())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn open_device(host: &Arc<LinuxUsbHost>, candidate: &MassStorageCandidate) -> Result<MassStorageDevice> {
    let device = MassStorageDevice::open(host.clone(), candidate)?;
    let lun = device.current_lun();
    info!(
        "{}: {} {} on LUN {}, {} x {} bytes",
        candidate.id,
        lun.vendor,
        lun.product,
        lun.lun,
        lun.blocks,
        lun.block_size
    );
    Ok(device)
}

fn gigabytes(bytes: u64) -> f64 {
    bytes as f64 / 1e9
}

/// Reads the stick's block device from sysfs without detaching anything.
fn kernel_disk(host: &LinuxUsbHost, candidate: &MassStorageCandidate) -> Option<KernelDisk> {
    host.kernel_disk(&candidate.id).unwrap_or_else(|e| {
        warn!("{}: could not look up its block device: {e}", candidate.id);
        None
    })
}

/// Fails if the kernel has the stick or one of its partitions mounted.
fn ensure_unmounted(disk: Option<&KernelDisk>) -> Result<()> {
    match disk {
        Some(disk) if disk.is_mounted() => {
            let places: Vec<String> = disk
                .mount_points
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            bail!(
                "/dev/{} is mounted at {}. Unmount it first.",
                disk.name,
                places.join(", ")
            )
        }
        _ => Ok(()),
    }
}

fn size_label(disk: Option<&KernelDisk>) -> String {
    match disk {
        Some(disk) => format!("{:.1} GB", gigabytes(disk.size_bytes)),
        None => "size unknown".to_string(),
    }
}

fn warn_erase(candidate: &MassStorageCandidate, disk: Option<&KernelDisk>) {
    let summary = candidate.summary();
    println!(
        "{} This will erase all data on '{}' ({}).",
        style("WARNING:").red().bold(),
        summary.display_name,
        size_label(disk),
    );
    println!("  Device: {}", style(&summary).cyan());
    if let Some(disk) = disk {
        println!("  Disk:   /dev/{}", disk.name);
    }
}

/// Turns a cancelled outcome into an error so the process exits non-zero.
fn finished(outcome: Outcome) -> Result<u64> {
    match outcome {
        Outcome::Completed { bytes_written } => Ok(bytes_written),
        Outcome::Cancelled { bytes_written } => bail!(
            "Cancelled after {} bytes; the stick's contents are incomplete.",
            bytes_written
        ),
    }
}

fn run_flash(
    host: &Arc<LinuxUsbHost>,
    image: &Path,
    no_verify: bool,
    chunk_size: usize,
    running: &AtomicBool,
) -> Result<()> {
    let candidates = list_sticks(host)?;
    let candidate = select_device(&candidates, "Select the stick to FLASH")?;
    let disk = kernel_disk(host, &candidate);
    ensure_unmounted(disk.as_ref())?;

    warn_erase(&candidate, disk.as_ref());
    println!("  Image:  {}", style(image.display()).cyan());
    println!();

    if !confirm_operation("Are you sure you want to proceed?")? {
        println!("Flash operation cancelled.");
        return Ok(());
    }
    println!();
    let device = open_device(host, &candidate)?;

    let decompress_pb = if Compression::from_path(image) == Compression::None {
        None
    } else {
        let pb = bars::spinner("Decompress")?;
        pb.enable_steady_tick(Duration::from_millis(100));
        Some(pb)
    };
    let source = ImageSource::open(image, running, |bytes| {
        if let Some(pb) = &decompress_pb {
            pb.set_position(bytes);
        }
    });
    if let Some(pb) = &decompress_pb {
        match &source {
            Ok(_) => pb.finish_with_message("Decompression complete."),
            Err(_) => pb.abandon_with_message("❌ Decompression failed."),
        }
    }
    let mut source = source.with_context(|| format!("Failed to open {}", image.display()))?;
    let len = source.len();

    let options = FlashOptions { chunk_size };
    let mut bars = StageBars::new()?;
    let mut on_progress = |p: &FlashProgress| bars.update(p);
    let result = if no_verify {
        flash::flash_with(device, source.file(), len, &options, running, &mut on_progress)
    } else {
        flash::flash_verified(device, source.file(), len, &options, running, &mut on_progress)
    };

    match result.map_err(anyhow::Error::from).and_then(finished) {
        Ok(_) => {
            bars.finish();
            let verified = if no_verify { " (verification skipped)" } else { ", verified" };
            println!(
                "\n✨ Successfully flashed {} with {}{}.",
                style(candidate.summary().display_name).cyan(),
                style(image.display()).cyan(),
                verified
            );
            Ok(())
        }
        Err(e) => {
            bars.abandon();
            Err(e)
        }
    }
}

fn run_install(host: &Arc<LinuxUsbHost>, package: &Path, running: &AtomicBool) -> Result<()> {
    let unpack = bars::spinner("Unpacking")?;
    unpack.enable_steady_tick(Duration::from_millis(100));
    let payloads = Payloads::from_dir(package);
    unpack.finish_and_clear();
    let payloads = payloads.with_context(|| format!("Failed to read {}", package.display()))?;

    let candidates = list_sticks(host)?;
    let candidate = select_device(&candidates, "Select the stick to INSTALL onto")?;
    let disk = kernel_disk(host, &candidate);
    ensure_unmounted(disk.as_ref())?;

    warn_erase(&candidate, disk.as_ref());
    println!("  Package: {}", style(package.display()).cyan());
    println!(
        "  Layout:  data partition + {} MiB EFI system partition",
        mbr::SYSTEM_PARTITION_SECTORS * SECTOR_SIZE as u64 / (1024 * 1024)
    );
    println!();

    if !confirm_operation("Are you sure you want to proceed?")? {
        println!("Install operation cancelled.");
        return Ok(());
    }
    println!();
    let device = open_device(host, &candidate)?;

    let mut bars = StageBars::new()?;
    let result = install::install(device, payloads, running, &mut |p: &FlashProgress| {
        bars.update(p)
    });
    if let Err(e) = result.map_err(anyhow::Error::from).and_then(finished) {
        bars.abandon();
        return Err(e);
    }
    bars.finish();

    println!(
        "\n✨ Installed onto {}.",
        style(candidate.summary().display_name).cyan()
    );
    if let Err(e) = print_partitions(host, &candidate.id) {
        warn!("could not read the partition table back: {e:#}");
    }
    Ok(())
}

/// Finds the stick again by its port path and prints the partition table
/// as written.
fn print_partitions(host: &Arc<LinuxUsbHost>, id: &DeviceId) -> Result<()> {
    let candidates = list_sticks(host)?;
    let candidate = enumerate::find_candidate(&candidates, id)
        .ok_or_else(|| FlashError::DeviceNotFound(id.to_string()))?;
    let mut device = MassStorageDevice::open(host.clone(), candidate)?;
    let data = device.read(0, 1)?;
    device.close();

    let sector: &[u8; SECTOR_SIZE] = data
        .get(..SECTOR_SIZE)
        .and_then(|s| <&[u8; SECTOR_SIZE]>::try_from(s).ok())
        .ok_or_else(|| anyhow!("short read of the boot sector"))?;
    let entries = mbr::parse_partitions(sector).ok_or_else(|| anyhow!("no MBR signature"))?;

    println!("\n  {:<4} {:<6} {:<10} {:>12} {:>10}", "#", "BOOT", "TYPE", "START", "SIZE");
    println!("  {:-<4} {:-<6} {:-<10} {:->12} {:->10}", "", "", "", "", "");
    for (i, entry) in entries.iter().enumerate().filter(|(_, e)| !e.is_empty()) {
        print_entry(i + 1, entry);
    }
    Ok(())
}

fn print_entry(number: usize, entry: &PartitionEntry) {
    let kind = match entry.kind {
        mbr::TYPE_EXFAT_NTFS => "exFAT/NTFS",
        TYPE_EFI_SYSTEM => "EFI",
        _ => "other",
    };
    let boot = if entry.status == mbr::STATUS_BOOTABLE { "*" } else { "" };
    let bytes = u64::from(entry.sectors) * SECTOR_SIZE as u64;
    println!(
        "  {:<4} {:<6} {:<10} {:>12} {:>7.1} GB",
        number,
        boot,
        kind,
        entry.lba_start,
        gigabytes(bytes)
    );
}

fn run_list(host: &LinuxUsbHost) -> Result<()> {
    let candidates = list_sticks(host)?;
    if candidates.is_empty() {
        println!("No USB mass-storage devices found.");
        return Ok(());
    }

    println!("Found {} USB mass-storage devices:", candidates.len());
    println!(
        "\n  {:<10} {:<25} {:<20} {:<10} {}",
        "ID", "NAME", "MANUFACTURER", "VID:PID", "ACCESS"
    );
    println!("  {:-<10} {:-<25} {:-<20} {:-<10} {:-<10}", "", "", "", "", "");
    for candidate in &candidates {
        let summary = candidate.summary();
        let access = if host.has_permission(&candidate.id) {
            style("ok").green()
        } else {
            style("denied").red()
        };
        println!(
            "  {:<10} {:<25} {:<20} {:<10} {}",
            summary.id.0, summary.display_name, summary.manufacturer, summary.vid_pid, access
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    // Dropped when main() returns, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    // Operations poll the flag between chunks.
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let cli = Cli::parse();
    logger::init(cli.verbose);

    let host = Arc::new(platform::default_host());

    match cli.command {
        Commands::Flash {
            image,
            no_verify,
            chunk_size,
        } => run_flash(&host, &image, no_verify, chunk_size, &running),
        Commands::Install { package } => run_install(&host, &package, &running),
        Commands::List => run_list(&host),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sizes_take_binary_suffixes() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("256K"), Ok(256 * 1024));
        assert_eq!(parse_size("1m"), Ok(1024 * 1024));
        assert_eq!(parse_size("2G"), Ok(2usize << 30));
        assert!(parse_size("0").is_err());
        assert!(parse_size("M").is_err());
        assert!(parse_size("ten").is_err());
    }

    #[test]
    fn flash_defaults() {
        let cli = Cli::parse_from(["stickr", "-vv", "flash", "debian.img.xz"]);
        assert_eq!(cli.verbose, 2);
        let Commands::Flash {
            image,
            no_verify,
            chunk_size,
        } = cli.command
        else {
            panic!("expected flash");
        };
        assert_eq!(image, PathBuf::from("debian.img.xz"));
        assert!(!no_verify);
        assert_eq!(chunk_size, DEFAULT_CHUNK_SIZE);
    }

    fn disk(mount_points: &[&str]) -> KernelDisk {
        KernelDisk {
            name: "sdb".into(),
            size_bytes: 16_000_000_000,
            mount_points: mount_points.iter().map(PathBuf::from).collect(),
        }
    }

    #[test]
    fn mounted_sticks_are_refused() {
        assert!(ensure_unmounted(None).is_ok());
        assert!(ensure_unmounted(Some(&disk(&[]))).is_ok());

        let err = ensure_unmounted(Some(&disk(&["/media/stick", "/mnt/efi"]))).unwrap_err();
        assert_eq!(
            err.to_string(),
            "/dev/sdb is mounted at /media/stick, /mnt/efi. Unmount it first."
        );
    }

    #[test]
    fn size_comes_from_the_kernel_disk() {
        assert_eq!(size_label(Some(&disk(&[]))), "16.0 GB");
        assert_eq!(size_label(None), "size unknown");
    }

    #[test]
    fn finished_maps_cancellation_to_an_error() {
        assert_eq!(finished(Outcome::Completed { bytes_written: 7 }).unwrap(), 7);
        let err = finished(Outcome::Cancelled { bytes_written: 512 }).unwrap_err();
        assert!(err.to_string().contains("512 bytes"));
    }
}
