//! A USB mass-storage device driven over bulk-only transport.
//!
//! [`MassStorageDevice::open`] follows the sequence operating systems use on
//! flash drives: claim the interface, ask for the number of logical units
//! (`GET MAX LUN`), then bring each unit up with INQUIRY, TEST UNIT READY
//! and READ CAPACITY. Units reporting "medium not present" (empty card reader
//! slots) are skipped. LUN 0 is the target for every read and write unless
//! another unit is selected.
use crate::block::{BlockDevice, ensure_whole_sectors};
use crate::enumerate::MassStorageCandidate;
use crate::error::{FlashError, Result};
use crate::usb::bot::{
    self, CommandBlockWrapper, CommandStatus, CommandStatusWrapper, Direction, TagGenerator,
};
use crate::usb::scsi::{self, Inquiry, Sense};
use crate::usb::{ClaimRequest, ControlRequest, DeviceId, UsbChannel, UsbHost};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use thiserror::Error;

// Some usb keys don't support bigger transfers
// (Linux issues at most 240 sectors per WRITE(10)).
pub const MAX_TRANSFER_SECTORS: u32 = 240;

const TEST_UNIT_READY_ATTEMPTS: usize = 5;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("command {opcode:#04x} failed: {sense}")]
    CheckCondition { opcode: u8, sense: Sense },
    #[error("command {0:#04x} failed and no sense data was returned")]
    NoSense(u8),
    #[error("phase error")]
    PhaseError,
    #[error("malformed command status wrapper")]
    BadStatus,
    #[error("status tag {got:#x} does not match command tag {expected:#x}")]
    TagMismatch { expected: u32, got: u32 },
    #[error("device is closed")]
    Closed,
}

impl From<CommandError> for io::Error {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Io(e) => e,
            CommandError::Closed => io::Error::new(io::ErrorKind::NotConnected, "device is closed"),
            other => io::Error::other(other),
        }
    }
}

enum DataPhase<'a> {
    None,
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

/// Geometry and identity of one usable logical unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LunInfo {
    pub lun: u8,
    pub block_size: u32,
    pub blocks: u64,
    pub vendor: String,
    pub product: String,
}

pub struct MassStorageDevice {
    host: Arc<dyn UsbHost>,
    id: DeviceId,
    channel: Option<Box<dyn UsbChannel>>,
    luns: BTreeMap<u8, LunInfo>,
    lun: u8,
    tags: TagGenerator,
}

impl MassStorageDevice {
    /// Opens `candidate` and initializes its logical units.
    ///
    /// Permission is checked before anything is sent to the device. If
    /// anything fails after the interface has been claimed, the channel is
    /// released before the error is returned.
    pub fn open(host: Arc<dyn UsbHost>, candidate: &MassStorageCandidate) -> Result<Self> {
        if !host.has_permission(&candidate.id) {
            return Err(FlashError::PermissionDenied {
                device: candidate.id.to_string(),
            });
        }

        let channel = host
            .claim(
                &candidate.id,
                ClaimRequest {
                    interface: candidate.interface,
                    endpoint_in: candidate.endpoint_in,
                    endpoint_out: candidate.endpoint_out,
                },
            )
            .map_err(FlashError::TransportIo)?;
        debug!("claimed interface {} on {}", candidate.interface, candidate.id);

        // Dropping `device` on an early return releases the channel.
        let mut device = MassStorageDevice {
            host,
            id: candidate.id.clone(),
            channel: Some(channel),
            luns: BTreeMap::new(),
            lun: 0,
            tags: TagGenerator::new(),
        };

        let max_lun = device.max_lun(candidate.interface);
        debug!("max LUN {max_lun}");

        for lun in 0..=max_lun {
            match device.init_lun(lun) {
                Ok(info) => {
                    info!(
                        "LUN {lun}: {} {} ({} x {} bytes)",
                        info.vendor, info.product, info.blocks, info.block_size
                    );
                    device.luns.insert(lun, info);
                }
                Err(CommandError::CheckCondition { sense, .. }) if sense.is_medium_not_present() => {
                    warn!("LUN {lun} has no medium inserted, skipping");
                }
                Err(e) => {
                    return Err(FlashError::Transport(format!(
                        "initializing LUN {lun} failed: {e}"
                    )));
                }
            }
        }

        if !device.luns.contains_key(&0) {
            return Err(FlashError::Transport(
                "logical unit 0 has no medium".to_string(),
            ));
        }
        Ok(device)
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Usable logical units in ascending order.
    pub fn luns(&self) -> impl Iterator<Item = &LunInfo> {
        self.luns.values()
    }

    /// The logical unit reads and writes currently go to.
    pub fn current_lun(&self) -> &LunInfo {
        &self.luns[&self.lun]
    }

    /// Redirects reads and writes to another usable logical unit.
    pub fn select_lun(&mut self, lun: u8) -> Result<()> {
        if !self.luns.contains_key(&lun) {
            return Err(FlashError::Transport(format!("LUN {lun} is not usable")));
        }
        self.lun = lun;
        Ok(())
    }

    /// Issues `GET MAX LUN`. Devices with a single unit may stall the
    /// request, which counts as LUN 0 only.
    fn max_lun(&mut self, interface: u8) -> u8 {
        let Some(channel) = self.channel.as_mut() else {
            return 0;
        };
        let request = ControlRequest {
            request_type: bot::REQUEST_TYPE_CLASS_IN,
            request: bot::REQUEST_GET_MAX_LUN,
            value: 0,
            index: u16::from(interface),
        };
        let mut buf = [0u8; 1];
        match channel.control_in(request, &mut buf) {
            Ok(1) => buf[0] & 0x0F,
            Ok(_) => 0,
            Err(e) => {
                debug!("GET MAX LUN failed ({e}), assuming a single LUN");
                0
            }
        }
    }

    fn init_lun(&mut self, lun: u8) -> std::result::Result<LunInfo, CommandError> {
        let mut raw = [0u8; scsi::INQUIRY_LEN];
        let len = self.command(lun, &scsi::inquiry(), DataPhase::In(&mut raw))?;
        let inquiry = Inquiry::parse(&raw[..len]).unwrap_or_default();

        let mut attempt = 1;
        loop {
            match self.command(lun, &scsi::test_unit_ready(), DataPhase::None) {
                Ok(_) => break,
                Err(CommandError::CheckCondition { sense, .. })
                    if sense.is_unit_attention() && attempt < TEST_UNIT_READY_ATTEMPTS =>
                {
                    debug!("LUN {lun}: unit attention, retrying TEST UNIT READY");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let mut raw = [0u8; scsi::READ_CAPACITY_10_LEN];
        let len = self.command(lun, &scsi::read_capacity_10(), DataPhase::In(&mut raw))?;
        let (mut last_lba, mut block_size) =
            scsi::parse_capacity_10(&raw[..len]).ok_or(CommandError::BadStatus)?;

        if last_lba == u64::from(u32::MAX) {
            let mut raw = [0u8; scsi::READ_CAPACITY_16_LEN];
            let len = self.command(lun, &scsi::read_capacity_16(), DataPhase::In(&mut raw))?;
            (last_lba, block_size) =
                scsi::parse_capacity_16(&raw[..len]).ok_or(CommandError::BadStatus)?;
        }
        if block_size == 0 {
            return Err(CommandError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "device reports a zero block size",
            )));
        }

        Ok(LunInfo {
            lun,
            block_size,
            blocks: last_lba + 1,
            vendor: inquiry.vendor,
            product: inquiry.product,
        })
    }

    /// Runs one command and turns a failed status into sense data.
    fn command(
        &mut self,
        lun: u8,
        cdb: &[u8],
        data: DataPhase<'_>,
    ) -> std::result::Result<usize, CommandError> {
        let (csw, transferred) = self.transact(lun, cdb, data)?;
        match csw.status {
            CommandStatus::Passed => Ok(transferred),
            CommandStatus::Failed => {
                let mut raw = [0u8; scsi::SENSE_LEN];
                let (csw, len) = self.transact(lun, &scsi::request_sense(), DataPhase::In(&mut raw))?;
                match Sense::parse(&raw[..len]) {
                    Some(sense) if csw.status == CommandStatus::Passed => {
                        Err(CommandError::CheckCondition {
                            opcode: cdb[0],
                            sense,
                        })
                    }
                    _ => Err(CommandError::NoSense(cdb[0])),
                }
            }
            CommandStatus::PhaseError => Err(CommandError::PhaseError),
            CommandStatus::Reserved(_) => Err(CommandError::BadStatus),
        }
    }

    /// CBW, data phase, CSW. Returns the status and the bytes moved in the
    /// data phase.
    fn transact(
        &mut self,
        lun: u8,
        cdb: &[u8],
        data: DataPhase<'_>,
    ) -> std::result::Result<(CommandStatusWrapper, usize), CommandError> {
        let channel = self.channel.as_mut().ok_or(CommandError::Closed)?;
        let tag = self.tags.next_tag();
        let (direction, data_len) = match &data {
            DataPhase::None => (Direction::None, 0),
            DataPhase::In(buf) => (Direction::In, buf.len()),
            DataPhase::Out(buf) => (Direction::Out, buf.len()),
        };
        let data_len = u32::try_from(data_len).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "transfer too large for one command")
        })?;

        let cbw = CommandBlockWrapper::new(tag, data_len, direction, lun, cdb);
        send_all(&mut **channel, &cbw.to_bytes())?;

        let transferred = match data {
            DataPhase::None => 0,
            // A short IN transfer ends the data phase.
            DataPhase::In(buf) => channel.bulk_in(buf)?,
            DataPhase::Out(buf) => {
                send_all(&mut **channel, buf)?;
                buf.len()
            }
        };

        let mut raw = [0u8; bot::CSW_LEN];
        let len = channel.bulk_in(&mut raw)?;
        let csw = CommandStatusWrapper::parse(&raw[..len]).ok_or(CommandError::BadStatus)?;
        if csw.tag != tag {
            return Err(CommandError::TagMismatch {
                expected: tag,
                got: csw.tag,
            });
        }
        Ok((csw, transferred))
    }

    fn check_range(&self, sector: u64, count: u64) -> io::Result<()> {
        let blocks = self.current_lun().blocks;
        if sector.checked_add(count).is_none_or(|end| end > blocks) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("sectors {sector}+{count} are past the end of the device ({blocks})"),
            ));
        }
        Ok(())
    }
}

fn send_all(channel: &mut dyn UsbChannel, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        let sent = channel.bulk_out(data)?;
        if sent == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "bulk OUT transfer accepted no data",
            ));
        }
        data = &data[sent..];
    }
    Ok(())
}

impl BlockDevice for MassStorageDevice {
    fn block_size(&self) -> u32 {
        self.current_lun().block_size
    }

    fn blocks(&self) -> u64 {
        self.current_lun().blocks
    }

    fn read(&mut self, sector: u64, count: u32) -> io::Result<Vec<u8>> {
        self.check_range(sector, u64::from(count))?;
        let block_size = self.block_size() as usize;
        let mut buf = vec![0u8; count as usize * block_size];
        let mut done = 0u32;
        while done < count {
            let n = (count - done).min(MAX_TRANSFER_SECTORS);
            let lba = sector + u64::from(done);
            let start = done as usize * block_size;
            let end = start + n as usize * block_size;
            let cdb = scsi::read_write(false, lba, n as u16);
            let got = self.command(self.lun, &cdb, DataPhase::In(&mut buf[start..end]))?;
            if got != end - start {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("short read at sector {lba}: {got} of {} bytes", end - start),
                ));
            }
            done += n;
        }
        Ok(buf)
    }

    fn write(&mut self, sector: u64, buf: &[u8]) -> io::Result<()> {
        let block_size = self.block_size();
        ensure_whole_sectors(buf.len(), block_size)?;
        let count = (buf.len() / block_size as usize) as u64;
        self.check_range(sector, count)?;

        let per_command = MAX_TRANSFER_SECTORS as usize * block_size as usize;
        for (index, chunk) in buf.chunks(per_command).enumerate() {
            let lba = sector + (index as u64) * u64::from(MAX_TRANSFER_SECTORS);
            let n = (chunk.len() / block_size as usize) as u16;
            let cdb = scsi::read_write(true, lba, n);
            self.command(self.lun, &cdb, DataPhase::Out(chunk))?;
        }
        Ok(())
    }

    fn check_access(&self) -> Result<()> {
        if self.channel.is_none() {
            return Err(FlashError::Transport(format!("device {} is closed", self.id)));
        }
        if !self.host.has_permission(&self.id) {
            return Err(FlashError::PermissionDenied {
                device: self.id.to_string(),
            });
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
            debug!("released {}", self.id);
        }
    }
}

impl Drop for MassStorageDevice {
    fn drop(&mut self) {
        self.close();
    }
}
