//! Streams an arbitrary-length byte source onto a [`BlockDevice`].
use crate::block::{self, BlockDevice};
use crate::error::{FlashError, Result};
use crate::progress::{FlashProgress, ProgressSink, Stage};
use log::trace;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// How an operation ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every byte was written, or the source ended early.
    Completed { bytes_written: u64 },
    /// `running` was cleared between two chunks.
    Cancelled { bytes_written: u64 },
}

impl Outcome {
    pub fn bytes_written(&self) -> u64 {
        match *self {
            Outcome::Completed { bytes_written }
            | Outcome::Cancelled { bytes_written } => bytes_written,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Starting,
    Transferring,
    Finalizing,
    Done,
    Failed,
}

/// Throughput bookkeeping for the once-per-second progress events.
pub(crate) struct Meter {
    last_time: Instant,
    last_bytes: u64,
}

impl Meter {
    pub(crate) fn new() -> Self {
        Meter {
            last_time: Instant::now(),
            last_bytes: 0,
        }
    }

    /// Returns the throughput since the last tick once a full interval has
    /// passed.
    pub(crate) fn tick(&mut self, bytes: u64) -> Option<f64> {
        let elapsed = self.last_time.elapsed();
        if elapsed < REPORT_INTERVAL {
            return None;
        }
        let speed = (bytes - self.last_bytes) as f64 / elapsed.as_secs_f64();
        self.last_time = Instant::now();
        self.last_bytes = bytes;
        Some(speed)
    }
}

/// A failed write on a device whose permission was revoked mid-transfer is
/// reported as the revocation.
pub(crate) fn explain_write_failure<D: BlockDevice + ?Sized>(
    device: &D,
    err: FlashError,
) -> FlashError {
    match err {
        FlashError::StreamWrite { .. } => match device.check_access() {
            Err(revoked @ FlashError::PermissionDenied { .. }) => revoked,
            _ => err,
        },
        other => other,
    }
}

/// Reads until `buf` is full or the source is exhausted.
pub(crate) fn fill<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Writes `total_len` bytes from `source` to `device` starting at
/// `start_sector`.
///
/// Data moves in chunks of `chunk_size` bytes (rounded up to whole sectors),
/// each issued as one device write in increasing sector order. Only the final
/// chunk can be partial; its last sector is zero-padded. Progress is reported
/// at most once per second, followed by one final event with a throughput of
/// zero.
///
/// `running` is checked before every chunk. Once a chunk write has been
/// issued it always completes, so a cancelled write has covered a whole
/// number of chunks.
///
/// A source that ends before `total_len` is not an error; compare
/// [`Outcome::bytes_written`] with `total_len` if the exact length
/// matters. Nothing is rolled back on failure.
#[allow(clippy::too_many_arguments)]
pub fn write_stream<D, R, P>(
    device: &mut D,
    start_sector: u64,
    source: &mut R,
    total_len: u64,
    stage: Stage,
    running: &AtomicBool,
    chunk_size: usize,
    progress: &mut P,
) -> Result<Outcome>
where
    D: BlockDevice + ?Sized,
    R: Read + ?Sized,
    P: ProgressSink + ?Sized,
{
    let block_size = block::sector_size(device)?;
    let chunk_size = chunk_size.max(1).div_ceil(block_size) * block_size;

    let mut state = WriterState::Starting;
    trace!("{stage}: {state:?} at sector {start_sector}, {total_len} bytes");

    let mut buffer = vec![0u8; chunk_size];
    let mut sector = start_sector;
    let mut written: u64 = 0;
    let mut meter = Meter::new();

    let outcome = loop {
        if written >= total_len {
            break Outcome::Completed {
                bytes_written: written,
            };
        }
        if !running.load(Ordering::SeqCst) {
            break Outcome::Cancelled {
                bytes_written: written,
            };
        }

        let to_read = std::cmp::min(chunk_size as u64, total_len - written) as usize;
        let read = match fill(source, &mut buffer[..to_read]) {
            Ok(n) => n,
            Err(err) => {
                state = WriterState::Failed;
                trace!("{stage}: {state:?} reading after {written} bytes");
                return Err(FlashError::StreamRead {
                    bytes_written: written,
                    source: err,
                });
            }
        };
        if read == 0 {
            break Outcome::Completed {
                bytes_written: written,
            };
        }
        if state == WriterState::Starting {
            state = WriterState::Transferring;
            trace!("{stage}: {state:?}");
        }

        // Stale bytes from a previous chunk must never reach the device.
        let sectors = read.div_ceil(block_size);
        let padded = sectors * block_size;
        buffer[read..padded].fill(0);

        if let Err(err) = device.write(sector, &buffer[..padded]) {
            state = WriterState::Failed;
            trace!("{stage}: {state:?} writing sector {sector}");
            return Err(FlashError::StreamWrite {
                bytes_written: written,
                source: err,
            });
        }
        sector += sectors as u64;
        written += read as u64;

        if let Some(throughput) = meter.tick(written) {
            progress.on_progress(&FlashProgress {
                bytes_written: written,
                total_bytes: total_len,
                throughput,
                stage,
            });
        }

        if read < to_read {
            break Outcome::Completed {
                bytes_written: written,
            };
        }
    };

    state = WriterState::Finalizing;
    trace!("{stage}: {state:?} after {written} bytes");
    progress.on_progress(&FlashProgress {
        bytes_written: written,
        total_bytes: total_len,
        throughput: 0.0,
        stage,
    });
    state = WriterState::Done;
    trace!("{stage}: {state:?} {outcome:?}");

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    /// Records every write as `(sector, bytes)`.
    #[derive(Default)]
    struct Recorder {
        writes: Vec<(u64, Vec<u8>)>,
        fail_at: Option<usize>,
    }

    impl BlockDevice for Recorder {
        fn block_size(&self) -> u32 {
            512
        }

        fn blocks(&self) -> u64 {
            1 << 20
        }

        fn read(&mut self, _sector: u64, count: u32) -> io::Result<Vec<u8>> {
            Ok(vec![0; count as usize * 512])
        }

        fn write(&mut self, sector: u64, buf: &[u8]) -> io::Result<()> {
            if self.fail_at == Some(self.writes.len()) {
                return Err(io::Error::other("bulk transfer failed"));
            }
            crate::block::ensure_whole_sectors(buf.len(), 512)?;
            self.writes.push((sector, buf.to_vec()));
            Ok(())
        }

        fn close(&mut self) {}
    }

    /// Fails every read once `limit` bytes have been handed out.
    struct Failing {
        inner: Cursor<Vec<u8>>,
        limit: u64,
    }

    impl Read for Failing {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inner.position() >= self.limit {
                return Err(io::Error::other("archive truncated"));
            }
            let room = (self.limit - self.inner.position()) as usize;
            let len = buf.len().min(room);
            self.inner.read(&mut buf[..len])
        }
    }

    /// Hands out at most `step` bytes per read.
    struct Trickle<R> {
        inner: R,
        step: usize,
    }

    impl<R: Read> Read for Trickle<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let len = buf.len().min(self.step);
            self.inner.read(&mut buf[..len])
        }
    }

    fn run(
        dev: &mut Recorder,
        data: &[u8],
        total: u64,
        chunk: usize,
    ) -> (Result<Outcome>, Vec<FlashProgress>) {
        let running = AtomicBool::new(true);
        let mut events = Vec::new();
        let mut sink = |p: &FlashProgress| events.push(*p);
        let result = write_stream(
            dev,
            0,
            &mut Cursor::new(data.to_vec()),
            total,
            Stage::WritingImage,
            &running,
            chunk,
            &mut sink,
        );
        (result, events)
    }

    #[test]
    fn last_sector_is_zero_padded() {
        let mut dev = Recorder::default();
        let data = vec![0xFFu8; 1000];
        let (result, events) = run(&mut dev, &data, 1000, DEFAULT_CHUNK_SIZE);

        assert_eq!(result.unwrap(), Outcome::Completed { bytes_written: 1000 });
        assert_eq!(dev.writes.len(), 1);
        let (sector, buf) = &dev.writes[0];
        assert_eq!(*sector, 0);
        assert_eq!(buf.len(), 1024);
        assert!(buf[..1000].iter().all(|&b| b == 0xFF));
        assert!(buf[1000..].iter().all(|&b| b == 0));

        let last = events.last().unwrap();
        assert_eq!(last.bytes_written, 1000);
        assert_eq!(last.throughput, 0.0);
    }

    #[test]
    fn stale_chunk_bytes_do_not_leak_into_padding() {
        let mut dev = Recorder::default();
        let data = vec![0xEEu8; 4096 + 100];
        let (result, _) = run(&mut dev, &data, data.len() as u64, 4096);

        assert_eq!(result.unwrap().bytes_written(), 4196);
        assert_eq!(dev.writes.len(), 2);
        assert_eq!(dev.writes[1].0, 8);
        let tail = &dev.writes[1].1;
        assert_eq!(tail.len(), 512);
        assert!(tail[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn writes_start_at_the_requested_sector() {
        let mut dev = Recorder::default();
        let running = AtomicBool::new(true);
        write_stream(
            &mut dev,
            3_934_464,
            &mut Cursor::new(vec![1u8; 2048]),
            2048,
            Stage::WritingSystemImage,
            &running,
            1024,
            &mut |_: &FlashProgress| {},
        )
        .unwrap();
        let sectors: Vec<u64> = dev.writes.iter().map(|(s, _)| *s).collect();
        assert_eq!(sectors, vec![3_934_464, 3_934_466]);
    }

    #[test]
    fn short_source_is_a_short_success() {
        let mut dev = Recorder::default();
        let (result, events) = run(&mut dev, &[7u8; 600], 10_000, 512);
        assert_eq!(result.unwrap(), Outcome::Completed { bytes_written: 600 });
        assert_eq!(events.last().unwrap().bytes_written, 600);
        assert_eq!(dev.writes.len(), 2);
    }

    #[test]
    fn source_longer_than_declared_is_cut() {
        let mut dev = Recorder::default();
        let (result, _) = run(&mut dev, &[7u8; 4096], 1536, 1024);
        assert_eq!(result.unwrap().bytes_written(), 1536);
        let total: usize = dev.writes.iter().map(|(_, b)| b.len()).sum();
        assert_eq!(total, 1536);
    }

    #[test]
    fn short_reads_still_fill_whole_chunks() {
        let mut dev = Recorder::default();
        let running = AtomicBool::new(true);
        let mut source = Trickle {
            inner: Cursor::new(vec![3u8; 8192]),
            step: 100,
        };
        write_stream(
            &mut dev,
            0,
            &mut source,
            8192,
            Stage::WritingImage,
            &running,
            4096,
            &mut |_: &FlashProgress| {},
        )
        .unwrap();
        assert_eq!(dev.writes.len(), 2);
        assert!(dev.writes.iter().all(|(_, b)| b.len() == 4096));
    }

    #[test]
    fn chunk_size_rounds_up_to_whole_sectors() {
        let mut dev = Recorder::default();
        let (result, _) = run(&mut dev, &[1u8; 2000], 2000, 700);
        result.unwrap();
        // 700 rounds to 1024, so no chunk but the last is padded.
        let lens: Vec<usize> = dev.writes.iter().map(|(_, b)| b.len()).collect();
        assert_eq!(lens, vec![1024, 1024]);
        let sectors: Vec<u64> = dev.writes.iter().map(|(s, _)| *s).collect();
        assert_eq!(sectors, vec![0, 2]);
    }

    #[test]
    fn read_failure_reports_bytes_so_far() {
        let mut dev = Recorder::default();
        let running = AtomicBool::new(true);
        let mut source = Failing {
            inner: Cursor::new(vec![0u8; 8192]),
            limit: 2048,
        };
        let err = write_stream(
            &mut dev,
            0,
            &mut source,
            8192,
            Stage::WritingImage,
            &running,
            1024,
            &mut |_: &FlashProgress| {},
        )
        .unwrap_err();
        assert!(matches!(
            err,
            FlashError::StreamRead {
                bytes_written: 2048,
                ..
            }
        ));
        assert_eq!(dev.writes.len(), 2);
    }

    #[test]
    fn write_failure_reports_bytes_so_far() {
        let mut dev = Recorder {
            fail_at: Some(1),
            ..Default::default()
        };
        let (result, events) = run(&mut dev, &[0u8; 4096], 4096, 1024);
        assert!(matches!(
            result.unwrap_err(),
            FlashError::StreamWrite {
                bytes_written: 1024,
                ..
            }
        ));
        assert!(events.is_empty());
    }

    #[test]
    fn cancelled_before_start_writes_nothing() {
        let mut dev = Recorder::default();
        let running = AtomicBool::new(false);
        let outcome = write_stream(
            &mut dev,
            0,
            &mut Cursor::new(vec![0u8; 4096]),
            4096,
            Stage::WritingImage,
            &running,
            1024,
            &mut |_: &FlashProgress| {},
        )
        .unwrap();
        assert_eq!(outcome, Outcome::Cancelled { bytes_written: 0 });
        assert!(dev.writes.is_empty());
    }

    #[test]
    fn zero_length_source_reports_completion() {
        let mut dev = Recorder::default();
        let (result, events) = run(&mut dev, &[], 0, 1024);
        assert_eq!(result.unwrap(), Outcome::Completed { bytes_written: 0 });
        assert!(dev.writes.is_empty());
        assert_eq!(events.len(), 1);
        assert!(events[0].is_final());
    }

    /// Reports a zero sector size.
    struct Unsized;

    impl BlockDevice for Unsized {
        fn block_size(&self) -> u32 {
            0
        }

        fn blocks(&self) -> u64 {
            0
        }

        fn read(&mut self, _sector: u64, _count: u32) -> io::Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn write(&mut self, _sector: u64, _buf: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    #[test]
    fn zero_block_size_is_invalid_input() {
        let running = AtomicBool::new(true);
        let err = write_stream(
            &mut Unsized,
            0,
            &mut Cursor::new(vec![1u8; 512]),
            512,
            Stage::WritingImage,
            &running,
            1024,
            &mut |_: &FlashProgress| {},
        )
        .unwrap_err();
        assert!(matches!(err, FlashError::Io(ref e) if e.kind() == io::ErrorKind::InvalidInput));
    }

    proptest! {
        #[test]
        fn sector_count_and_padding(len in 0usize..20_000, chunk_sectors in 1usize..16) {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8 + 1).collect();
            let mut dev = Recorder::default();
            let (result, events) = run(&mut dev, &data, len as u64, chunk_sectors * 512);

            prop_assert_eq!(result.unwrap().bytes_written(), len as u64);

            let sectors: usize = dev.writes.iter().map(|(_, b)| b.len() / 512).sum();
            prop_assert_eq!(sectors, len.div_ceil(512));

            // Writes are contiguous and increasing.
            let mut next = 0u64;
            for (sector, buf) in &dev.writes {
                prop_assert_eq!(*sector, next);
                next += (buf.len() / 512) as u64;
            }

            let written: Vec<u8> = dev.writes.iter().flat_map(|(_, b)| b.clone()).collect();
            prop_assert_eq!(&written[..len], &data[..]);
            prop_assert!(written[len..].iter().all(|&b| b == 0));

            let mut last = 0;
            for event in &events {
                prop_assert!(event.bytes_written >= last);
                last = event.bytes_written;
            }
            let fin = events.last().unwrap();
            prop_assert_eq!(fin.bytes_written, len as u64);
            prop_assert_eq!(fin.throughput, 0.0);
        }
    }
}
