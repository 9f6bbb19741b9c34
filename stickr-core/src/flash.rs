//! Writes one whole-disk image to a device.
//!
//! The image is written verbatim from sector 0. No partitioning happens here:
//! raw `.img` and hybrid `.iso` files already carry whatever partition table
//! they need.
use crate::block::{BlockDevice, Closing};
use crate::error::{FlashError, Result, Shortfall};
use crate::progress::{ProgressSink, Stage};
use crate::stream::{self, DEFAULT_CHUNK_SIZE, Outcome};
use crate::verify;
use log::info;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::AtomicBool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashOptions {
    /// Bytes per device write, rounded up to whole sectors.
    pub chunk_size: usize,
}

impl Default for FlashOptions {
    fn default() -> Self {
        FlashOptions {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Writes `image_len` bytes of `image` to `device` from sector 0.
///
/// The device is taken by value and closed before this returns, on success,
/// cancellation and failure alike.
///
/// # Errors
///
/// - [`FlashError::PermissionDenied`] if the device permission is gone.
/// - [`FlashError::DeviceTooSmall`] if the image is larger than the device.
/// - [`FlashError::StreamRead`] / [`FlashError::StreamWrite`] if I/O fails
///   mid-transfer. Sectors written so far stay written.
pub fn flash<D, R, P>(
    device: D,
    image: &mut R,
    image_len: u64,
    running: &AtomicBool,
    progress: &mut P,
) -> Result<Outcome>
where
    D: BlockDevice,
    R: Read + ?Sized,
    P: ProgressSink + ?Sized,
{
    flash_with(
        device,
        image,
        image_len,
        &FlashOptions::default(),
        running,
        progress,
    )
}

/// [`flash`] with explicit options.
pub fn flash_with<D, R, P>(
    device: D,
    image: &mut R,
    image_len: u64,
    options: &FlashOptions,
    running: &AtomicBool,
    progress: &mut P,
) -> Result<Outcome>
where
    D: BlockDevice,
    R: Read + ?Sized,
    P: ProgressSink + ?Sized,
{
    let mut device = Closing::new(device);
    let outcome = write_image(&mut *device, image, image_len, options, running, progress)?;
    drop(device);
    info!("flash finished: {outcome:?}");
    Ok(outcome)
}

/// [`flash_with`], then reads the written sectors back and compares their
/// SHA-256 with the image's before closing the device.
pub fn flash_verified<D, R, P>(
    device: D,
    image: &mut R,
    image_len: u64,
    options: &FlashOptions,
    running: &AtomicBool,
    progress: &mut P,
) -> Result<Outcome>
where
    D: BlockDevice,
    R: Read + Seek + ?Sized,
    P: ProgressSink + ?Sized,
{
    let mut device = Closing::new(device);
    let outcome = write_image(&mut *device, image, image_len, options, running, progress)?;
    let Outcome::Completed { bytes_written } = outcome else {
        return Ok(outcome);
    };

    image.seek(SeekFrom::Start(0))?;
    let verified = verify::run(&mut *device, 0, image, bytes_written, running, progress)?;
    drop(device);
    info!("flash finished, verification: {verified:?}");
    Ok(match verified {
        Outcome::Completed { .. } => outcome,
        cancelled => cancelled,
    })
}

fn write_image<D, R, P>(
    device: &mut D,
    image: &mut R,
    image_len: u64,
    options: &FlashOptions,
    running: &AtomicBool,
    progress: &mut P,
) -> Result<Outcome>
where
    D: BlockDevice + ?Sized,
    R: Read + ?Sized,
    P: ProgressSink + ?Sized,
{
    device.check_access()?;

    let capacity = device.capacity();
    if capacity < image_len {
        return Err(FlashError::DeviceTooSmall(Shortfall::Image {
            image_len,
            capacity,
        }));
    }

    info!("writing {image_len} bytes to a {capacity}-byte device");
    stream::write_stream(
        device,
        0,
        image,
        image_len,
        Stage::WritingImage,
        running,
        options.chunk_size,
        progress,
    )
    .map_err(|err| stream::explain_write_failure(device, err))
}
