//! The error type shared by every imaging operation.
use crate::progress::Stage;
use std::fmt;
use std::io;
use thiserror::Error;

/// Why a device was judged too small for the requested operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shortfall {
    /// A whole-disk image does not fit on the device.
    Image { image_len: u64, capacity: u64 },
    /// The fixed-size system partition plus the 1 MiB alignment gap leaves no
    /// room for a data partition.
    SystemPartition { total_blocks: u64, minimum: u64 },
    /// The layout does not fit the 32-bit LBA fields of an MBR.
    MbrAddressing { total_blocks: u64 },
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shortfall::Image {
                image_len,
                capacity,
            } => write!(f, "image is {image_len} bytes but device holds {capacity} bytes"),
            Shortfall::SystemPartition {
                total_blocks,
                minimum,
            } => write!(
                f,
                "{total_blocks} sectors leave no room for a data partition next to the \
                 system partition (need more than {minimum})"
            ),
            Shortfall::MbrAddressing { total_blocks } => write!(
                f,
                "{total_blocks} sectors cannot be addressed by an MBR partition table"
            ),
        }
    }
}

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("no USB permission for device {device}")]
    PermissionDenied { device: String },
    #[error("USB transport error: {0}")]
    Transport(String),
    #[error("USB transport error: {0}")]
    TransportIo(#[source] io::Error),
    #[error("device too small: {0}")]
    DeviceTooSmall(Shortfall),
    #[error("failed to read image after {bytes_written} bytes: {source}")]
    StreamRead {
        bytes_written: u64,
        #[source]
        source: io::Error,
    },
    #[error("failed to write device after {bytes_written} bytes: {source}")]
    StreamWrite {
        bytes_written: u64,
        #[source]
        source: io::Error,
    },
    #[error("package is missing {}", .missing.join(", "))]
    PackageIncomplete { missing: Vec<&'static str> },
    #[error("core image is {len} bytes, at most {max} fit before the data partition")]
    CoreImageTooLarge { len: u64, max: u64 },
    #[error("system image is {len} bytes, the system partition holds {max}")]
    SystemImageTooLarge { len: u64, max: u64 },
    #[error("{0}-byte sectors are not supported by this layout")]
    UnsupportedSectorSize(u32),
    #[error("verification failed: hash mismatch")]
    VerifyMismatch,
    #[error("device {0} is no longer attached")]
    DeviceNotFound(String),
    #[error("{stage} failed: {source}")]
    Install {
        stage: Stage,
        #[source]
        source: Box<FlashError>,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl FlashError {
    /// Attaches the install stage that was running when `self` occurred.
    pub(crate) fn at(self, stage: Stage) -> Self {
        FlashError::Install {
            stage,
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through install stage wrappers.
    pub fn root(&self) -> &FlashError {
        match self {
            FlashError::Install { source, .. } => source.root(),
            other => other,
        }
    }

    /// The install stage at which this error occurred, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            FlashError::Install { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlashError>;
