//! The core, UI-agnostic library for the `stickr` USB imaging utility.
//!
//! `stickr-core` writes disk images to USB flash drives without going through
//! the kernel's block layer. It claims the mass-storage interface of a stick
//! directly, speaks the bulk-only transport and SCSI to it, and exposes the
//! result as a [`BlockDevice`](block::BlockDevice). On top of that it offers
//! two operations:
//!
//! - [`flash`](mod@flash): write one whole-disk image (`.img`, hybrid `.iso`)
//!   from sector 0, optionally verified by reading it back.
//! - [`install`](mod@install): lay out a Ventoy-style drive: an MBR with a
//!   data partition and an EFI system partition, a core image right after
//!   the MBR and a system image at the end of the disk.
//!
//! The library is structured into several key modules:
//! - [`usb`]: host abstraction, bulk-only framing, SCSI commands and the
//!   [`MassStorageDevice`](usb::mass_storage::MassStorageDevice) transport.
//! - [`enumerate`]: finds bulk-only mass-storage interfaces.
//! - [`platform`]: the Linux USB host (sysfs + usbdevfs).
//! - [`stream`]: the chunked, sector-aligned writer both operations share.
//! - [`mbr`], [`package`], [`image`], [`verify`]: the pieces around them.
//!
//! Operations report through a [`ProgressSink`](progress::ProgressSink) and
//! can be cancelled by clearing a shared `AtomicBool` between chunks.
//!
//! ## Example: Flashing an image to the first stick found
//!
//! ```rust,no_run
//! use stickr_core::{enumerate, flash, image::ImageSource, platform};
//! use stickr_core::progress::FlashProgress;
//! use stickr_core::usb::mass_storage::MassStorageDevice;
//! use std::path::Path;
//! use std::sync::{Arc, atomic::AtomicBool};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let host = Arc::new(platform::default_host());
//!     let candidates = enumerate::list_candidates(host.as_ref())?;
//!     let Some(stick) = candidates.first() else {
//!         return Err("no USB mass-storage device found".into());
//!     };
//!
//!     let running = AtomicBool::new(true);
//!     let mut image = ImageSource::open(Path::new("debian.img.xz"), &running, |_| {})?;
//!     let len = image.len();
//!
//!     let device = MassStorageDevice::open(host, stick)?;
//!     let outcome = flash::flash(device, image.file(), len, &running, &mut |p: &FlashProgress| {
//!         println!("{:.0}%", p.overall() * 100.0);
//!     })?;
//!     println!("{} bytes written", outcome.bytes_written());
//!     Ok(())
//! }
//! ```

pub mod block;
pub mod enumerate;
pub mod error;
pub mod flash;
pub mod image;
pub mod install;
pub mod mbr;
pub mod package;
pub mod platform;
pub mod progress;
pub mod stream;
pub mod usb;
pub mod verify;

pub use error::{FlashError, Result};
pub use stream::Outcome;
