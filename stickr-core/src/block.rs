//! The sector-addressed device abstraction every writer targets.
use crate::error::Result;
use std::io;
use std::ops::{Deref, DerefMut};

/// A raw storage target addressed in whole sectors.
///
/// All offsets are sector indices. Buffers passed to [`write`](Self::write)
/// must be a whole number of sectors long; callers pad partial sectors with
/// zeros before issuing a write.
pub trait BlockDevice {
    /// Bytes per sector, typically 512.
    fn block_size(&self) -> u32;

    /// Device capacity in sectors.
    fn blocks(&self) -> u64;

    fn capacity(&self) -> u64 {
        self.blocks() * u64::from(self.block_size())
    }

    /// Reads `count` sectors starting at `sector`.
    fn read(&mut self, sector: u64, count: u32) -> io::Result<Vec<u8>>;

    /// Writes `buf` starting at `sector`.
    fn write(&mut self, sector: u64, buf: &[u8]) -> io::Result<()>;

    /// Re-checks that the caller is still allowed to talk to the device.
    fn check_access(&self) -> Result<()> {
        Ok(())
    }

    /// Releases the device. Calling this more than once is a no-op.
    fn close(&mut self);
}

impl<D: BlockDevice + ?Sized> BlockDevice for Box<D> {
    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn blocks(&self) -> u64 {
        (**self).blocks()
    }

    fn read(&mut self, sector: u64, count: u32) -> io::Result<Vec<u8>> {
        (**self).read(sector, count)
    }

    fn write(&mut self, sector: u64, buf: &[u8]) -> io::Result<()> {
        (**self).write(sector, buf)
    }

    fn check_access(&self) -> Result<()> {
        (**self).check_access()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Rejects buffers that are not a whole number of sectors.
pub fn ensure_whole_sectors(buf_len: usize, block_size: u32) -> io::Result<()> {
    if block_size == 0 || buf_len % block_size as usize != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("buffer of {buf_len} bytes is not a multiple of the {block_size}-byte sector size"),
        ));
    }
    Ok(())
}

/// The device's sector size, rejecting devices that report zero.
pub(crate) fn sector_size<D: BlockDevice + ?Sized>(device: &D) -> io::Result<usize> {
    match device.block_size() {
        0 => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "device reports a zero block size",
        )),
        size => Ok(size as usize),
    }
}

/// Owns a device for the length of one operation and closes it when dropped,
/// whichever way the operation exits.
pub(crate) struct Closing<D: BlockDevice>(D);

impl<D: BlockDevice> Closing<D> {
    pub(crate) fn new(device: D) -> Self {
        Closing(device)
    }
}

impl<D: BlockDevice> Deref for Closing<D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.0
    }
}

impl<D: BlockDevice> DerefMut for Closing<D> {
    fn deref_mut(&mut self) -> &mut D {
        &mut self.0
    }
}

impl<D: BlockDevice> Drop for Closing<D> {
    fn drop(&mut self) {
        self.0.close();
    }
}
