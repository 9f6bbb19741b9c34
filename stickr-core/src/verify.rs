//! Read-back verification of written sectors.
use crate::block::{self, BlockDevice};
use crate::error::{FlashError, Result};
use crate::progress::{FlashProgress, ProgressSink, Stage};
use crate::stream::{self, DEFAULT_CHUNK_SIZE, Meter, Outcome};
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};

/// Reads `len` bytes back from `device` starting at `start_sector` and
/// compares their SHA-256 with that of the next `len` bytes of `source`.
///
/// Only the first `len` bytes of the padded final sector take part in the
/// comparison. A source shorter than `len` is a [`FlashError::StreamRead`].
pub fn run<D, R, P>(
    device: &mut D,
    start_sector: u64,
    source: &mut R,
    len: u64,
    running: &AtomicBool,
    progress: &mut P,
) -> Result<Outcome>
where
    D: BlockDevice + ?Sized,
    R: Read + ?Sized,
    P: ProgressSink + ?Sized,
{
    let block_size = block::sector_size(device)?;
    let chunk_size = DEFAULT_CHUNK_SIZE.div_ceil(block_size) * block_size;

    let mut source_hasher = Sha256::new();
    let mut device_hasher = Sha256::new();
    let mut source_buf = vec![0u8; chunk_size];
    let mut sector = start_sector;
    let mut verified: u64 = 0;
    let mut meter = Meter::new();

    info!("verifying {len} bytes from sector {start_sector}");
    while verified < len {
        if !running.load(Ordering::SeqCst) {
            return Ok(Outcome::Cancelled {
                bytes_written: verified,
            });
        }

        let chunk = std::cmp::min(chunk_size as u64, len - verified) as usize;
        let read = stream::fill(source, &mut source_buf[..chunk]).map_err(|err| {
            FlashError::StreamRead {
                bytes_written: verified,
                source: err,
            }
        })?;
        if read < chunk {
            return Err(FlashError::StreamRead {
                bytes_written: verified,
                source: std::io::ErrorKind::UnexpectedEof.into(),
            });
        }

        let sectors = chunk.div_ceil(block_size);
        let on_device = device
            .read(sector, sectors as u32)
            .map_err(FlashError::TransportIo)?;
        if on_device.len() < chunk {
            return Err(FlashError::Transport(format!(
                "short read at sector {sector}: {} of {chunk} bytes",
                on_device.len()
            )));
        }

        source_hasher.update(&source_buf[..chunk]);
        device_hasher.update(&on_device[..chunk]);
        sector += sectors as u64;
        verified += chunk as u64;

        if let Some(throughput) = meter.tick(verified) {
            progress.on_progress(&FlashProgress {
                bytes_written: verified,
                total_bytes: len,
                throughput,
                stage: Stage::Verifying,
            });
        }
    }

    progress.on_progress(&FlashProgress {
        bytes_written: verified,
        total_bytes: len,
        throughput: 0.0,
        stage: Stage::Verifying,
    });

    let expected = source_hasher.finalize();
    let actual = device_hasher.finalize();
    debug!("source sha256 {expected:x}, device sha256 {actual:x}");
    if expected != actual {
        return Err(FlashError::VerifyMismatch);
    }
    Ok(Outcome::Completed {
        bytes_written: verified,
    })
}
