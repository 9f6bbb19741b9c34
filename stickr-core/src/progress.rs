//! Progress reporting for imaging operations.
//!
//! Every long-running operation in this crate reports through a
//! [`ProgressSink`]. Any `FnMut(&FlashProgress)` closure is a sink, so a
//! front-end can simply pass a closure that updates its progress bar.
//!
//! Each [`Stage`] owns a fixed window of the overall operation. The
//! multi-part installer uses this to blend per-stage fractions into one
//! overall percentage; a plain flash has a single stage covering the whole
//! range.
use std::fmt;

/// The phase an operation is in. Stages of one operation only ever advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    WritingImage,
    Verifying,
    PreparingPartitionTable,
    WritingCoreImage,
    WritingSystemImage,
    Finalizing,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::WritingImage => "Writing image",
            Stage::Verifying => "Verifying",
            Stage::PreparingPartitionTable => "Preparing partition table",
            Stage::WritingCoreImage => "Writing core image",
            Stage::WritingSystemImage => "Writing system image",
            Stage::Finalizing => "Finalizing",
        }
    }

    /// The `(start, end)` share of the overall operation covered by this stage.
    pub fn window(&self) -> (f64, f64) {
        match self {
            Stage::WritingImage | Stage::Verifying => (0.0, 1.0),
            Stage::PreparingPartitionTable => (0.0, 0.10),
            Stage::WritingCoreImage => (0.10, 0.20),
            Stage::WritingSystemImage => (0.20, 0.95),
            Stage::Finalizing => (0.95, 1.0),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A snapshot handed to the caller while data is moving.
///
/// Byte counts always belong to the current stage. Use
/// [`overall`](Self::overall) for the position in the whole operation and
/// [`Outcome::bytes_written`](crate::Outcome::bytes_written) for the total.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlashProgress {
    /// Bytes of the current stage written so far.
    pub bytes_written: u64,
    /// Bytes the current stage will write.
    pub total_bytes: u64,
    /// Bytes per second over the last reporting window. Zero on the final
    /// event of a stage.
    pub throughput: f64,
    pub stage: Stage,
}

impl FlashProgress {
    /// Progress within the current stage, in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        (self.bytes_written as f64 / self.total_bytes as f64).min(1.0)
    }

    /// Progress of the whole operation, blended through the stage window.
    pub fn overall(&self) -> f64 {
        let (start, end) = self.stage.window();
        start + (end - start) * self.fraction()
    }

    pub fn is_final(&self) -> bool {
        self.throughput == 0.0 && self.bytes_written >= self.total_bytes
    }
}

/// Receives progress snapshots.
pub trait ProgressSink {
    fn on_progress(&mut self, progress: &FlashProgress);
}

impl<F> ProgressSink for F
where
    F: FnMut(&FlashProgress),
{
    fn on_progress(&mut self, progress: &FlashProgress) {
        self(progress)
    }
}
