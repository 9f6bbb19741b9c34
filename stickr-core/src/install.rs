//! Installs a Ventoy-style multi-part layout onto a device.
//!
//! ```text
//! sector 0            MBR: boot code, data partition, EFI system partition
//! sectors 1..2048     core image
//! 2048..system_start  data partition, left untouched
//! system_start..end   system partition image
//! ```
//!
//! Every precondition is checked before the first write. Once writing has
//! started a failure leaves the device partially written; nothing is rolled
//! back.
use crate::block::{BlockDevice, Closing};
use crate::error::{FlashError, Result};
use crate::flash::FlashOptions;
use crate::mbr::{self, DATA_PARTITION_START, PartitionLayout, SECTOR_SIZE};
use crate::package::Payloads;
use crate::progress::{FlashProgress, ProgressSink, Stage};
use crate::stream::{self, Outcome};
use log::{debug, info};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};

/// The core image sits right after the MBR.
pub const CORE_IMAGE_SECTOR: u64 = 1;

/// Largest core image that fits between the MBR and the data partition.
pub const MAX_CORE_IMAGE_LEN: u64 = (DATA_PARTITION_START - CORE_IMAGE_SECTOR) * SECTOR_SIZE as u64;

/// Writes the partition table, the core image and the system image.
///
/// The device is closed before this returns. Errors carry the stage that
/// failed, see [`FlashError::stage`]; cancellation is observed between
/// stages and between chunks and yields [`Outcome::Cancelled`] with the
/// number of payload bytes written so far.
pub fn install<D, R, P>(
    device: D,
    payloads: Payloads<R>,
    running: &AtomicBool,
    progress: &mut P,
) -> Result<Outcome>
where
    D: BlockDevice,
    R: Read,
    P: ProgressSink + ?Sized,
{
    install_with(device, payloads, &FlashOptions::default(), running, progress)
}

/// [`install`] with explicit options.
pub fn install_with<D, R, P>(
    device: D,
    payloads: Payloads<R>,
    options: &FlashOptions,
    running: &AtomicBool,
    progress: &mut P,
) -> Result<Outcome>
where
    D: BlockDevice,
    R: Read,
    P: ProgressSink + ?Sized,
{
    let mut device = Closing::new(device);
    let outcome = Installer {
        device: &mut *device,
        options,
        running,
        progress,
        written: 0,
    }
    .run(payloads)?;
    drop(device);
    info!("install finished: {outcome:?}");
    Ok(outcome)
}

struct Installer<'a, D: ?Sized, P: ?Sized> {
    device: &'a mut D,
    options: &'a FlashOptions,
    running: &'a AtomicBool,
    progress: &'a mut P,
    written: u64,
}

impl<D, P> Installer<'_, D, P>
where
    D: BlockDevice + ?Sized,
    P: ProgressSink + ?Sized,
{
    fn run<R: Read>(mut self, payloads: Payloads<R>) -> Result<Outcome> {
        let Payloads {
            boot_record,
            core_image,
            mut system_image,
            system_image_len,
        } = payloads;

        let layout = self
            .check_preconditions(core_image.len() as u64, system_image_len)
            .map_err(|err| err.at(Stage::PreparingPartitionTable))?;
        info!("installing with {layout:?}");

        if self.cancelled() {
            return Ok(self.outcome(true));
        }
        self.write_partition_table(&boot_record, &layout)
            .map_err(|err| err.at(Stage::PreparingPartitionTable))?;

        let core_len = core_image.len() as u64;
        let finished = self
            .write_stage(
                Stage::WritingCoreImage,
                CORE_IMAGE_SECTOR,
                &mut core_image.as_slice(),
                core_len,
            )
            .map_err(|err| err.at(Stage::WritingCoreImage))?;
        if !finished {
            return Ok(self.outcome(true));
        }

        let finished = self
            .write_stage(
                Stage::WritingSystemImage,
                layout.system_start,
                &mut system_image,
                system_image_len,
            )
            .map_err(|err| err.at(Stage::WritingSystemImage))?;
        if !finished {
            return Ok(self.outcome(true));
        }

        if self.cancelled() {
            return Ok(self.outcome(true));
        }
        self.device
            .check_access()
            .map_err(|err| err.at(Stage::Finalizing))?;
        // Nothing is written while finalizing.
        self.progress.on_progress(&FlashProgress {
            bytes_written: 0,
            total_bytes: 0,
            throughput: 0.0,
            stage: Stage::Finalizing,
        });
        Ok(self.outcome(false))
    }

    fn check_preconditions(&self, core_len: u64, system_len: u64) -> Result<PartitionLayout> {
        self.device.check_access()?;

        let block_size = self.device.block_size();
        if block_size as usize != SECTOR_SIZE {
            return Err(FlashError::UnsupportedSectorSize(block_size));
        }

        let layout = PartitionLayout::compute(self.device.blocks())?;

        if core_len > MAX_CORE_IMAGE_LEN {
            return Err(FlashError::CoreImageTooLarge {
                len: core_len,
                max: MAX_CORE_IMAGE_LEN,
            });
        }
        let system_max = layout.system_sectors * SECTOR_SIZE as u64;
        if system_len > system_max {
            return Err(FlashError::SystemImageTooLarge {
                len: system_len,
                max: system_max,
            });
        }
        Ok(layout)
    }

    fn write_partition_table(&mut self, boot_record: &[u8], layout: &PartitionLayout) -> Result<()> {
        let sector = mbr::build_mbr(boot_record, layout)?;
        debug!("writing partition table");
        if let Err(err) = self.device.write(0, &sector) {
            let err = FlashError::StreamWrite {
                bytes_written: 0,
                source: err,
            };
            return Err(stream::explain_write_failure(&*self.device, err));
        }
        self.written += SECTOR_SIZE as u64;
        self.progress.on_progress(&FlashProgress {
            bytes_written: SECTOR_SIZE as u64,
            total_bytes: SECTOR_SIZE as u64,
            throughput: 0.0,
            stage: Stage::PreparingPartitionTable,
        });
        Ok(())
    }

    /// Streams one payload. Returns `false` if the stage was cancelled.
    fn write_stage<R: Read + ?Sized>(
        &mut self,
        stage: Stage,
        start_sector: u64,
        source: &mut R,
        len: u64,
    ) -> Result<bool> {
        if self.cancelled() {
            return Ok(false);
        }
        self.device.check_access()?;
        debug!("{stage}: {len} bytes at sector {start_sector}");

        let outcome = stream::write_stream(
            &mut *self.device,
            start_sector,
            source,
            len,
            stage,
            self.running,
            self.options.chunk_size,
            &mut *self.progress,
        )
        .map_err(|err| stream::explain_write_failure(&*self.device, err))?;
        self.written += outcome.bytes_written();

        match outcome {
            Outcome::Cancelled { .. } => Ok(false),
            Outcome::Completed { bytes_written } if bytes_written < len => {
                Err(FlashError::StreamRead {
                    bytes_written,
                    source: io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("payload ended after {bytes_written} of {len} bytes"),
                    ),
                })
            }
            Outcome::Completed { .. } => Ok(true),
        }
    }

    fn cancelled(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    fn outcome(&self, cancelled: bool) -> Outcome {
        let bytes_written = self.written;
        if cancelled {
            Outcome::Cancelled { bytes_written }
        } else {
            Outcome::Completed { bytes_written }
        }
    }
}
