//! Common test utilities: an in-memory bulk-only USB stick and plain block
//! devices.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use stickr_core::block::BlockDevice;
use stickr_core::usb::bot::{
    self, CommandBlockWrapper, CommandStatus, CommandStatusWrapper, Direction,
};
use stickr_core::usb::scsi::{self, Sense};
use stickr_core::usb::{
    ClaimRequest, ControlRequest, DeviceId, EndpointInfo, InterfaceInfo, TransferType,
    UsbChannel, UsbDeviceInfo, UsbHost,
};

pub const STICK_ID: &str = "1-4";
pub const INTERFACE: u8 = 0;
pub const EP_IN: u8 = 0x81;
pub const EP_OUT: u8 = 0x02;

/// One logical unit of the fake stick. Sectors never written read as zeros.
#[derive(Debug, Clone)]
pub struct FakeLun {
    pub block_size: u32,
    pub blocks: u64,
    pub present: bool,
    /// TEST UNIT READY answers this many unit attentions before passing.
    pub unit_attentions: usize,
    pub sectors: BTreeMap<u64, Vec<u8>>,
}

impl FakeLun {
    pub fn new(blocks: u64) -> Self {
        FakeLun {
            block_size: 512,
            blocks,
            present: true,
            unit_attentions: 0,
            sectors: BTreeMap::new(),
        }
    }

    pub fn empty_slot() -> Self {
        FakeLun {
            present: false,
            ..FakeLun::new(0)
        }
    }

    /// `len` bytes starting at `sector`.
    pub fn bytes(&self, sector: u64, len: usize) -> Vec<u8> {
        let bs = self.block_size as usize;
        let mut out = Vec::with_capacity(len.div_ceil(bs) * bs);
        let mut s = sector;
        while out.len() < len {
            match self.sectors.get(&s) {
                Some(data) => out.extend_from_slice(data),
                None => out.resize(out.len() + bs, 0),
            }
            s += 1;
        }
        out.truncate(len);
        out
    }
}

struct PendingWrite {
    lun: u8,
    lba: u64,
    tag: u32,
    expected: usize,
    data: Vec<u8>,
}

pub struct FakeState {
    pub luns: Vec<FakeLun>,
    /// `None` stalls GET MAX LUN.
    pub max_lun: Option<u8>,
    pub permitted: bool,
    /// Permission is revoked at the next command once this many WRITE
    /// commands completed.
    pub revoke_after_writes: Option<usize>,
    pub claims: usize,
    pub closes: usize,
    pub control_transfers: usize,
    pub bulk_transfers: usize,
    /// Every completed WRITE as `(lun, lba, sectors)`.
    pub writes: Vec<(u8, u64, u32)>,
    sense: Sense,
    responses: VecDeque<Vec<u8>>,
    pending: Option<PendingWrite>,
}

impl FakeState {
    pub fn transfers(&self) -> usize {
        self.control_transfers + self.bulk_transfers
    }

    fn status(&mut self, tag: u32, status: CommandStatus) {
        let csw = CommandStatusWrapper {
            tag,
            residue: 0,
            status,
        };
        self.responses.push_back(csw.to_bytes().to_vec());
    }

    /// A failed IN command ends its data phase with a zero-length packet.
    fn fail(&mut self, cbw: &CommandBlockWrapper, sense: Sense) {
        self.sense = sense;
        if cbw.direction == Direction::In {
            self.responses.push_back(Vec::new());
        }
        self.status(cbw.tag, CommandStatus::Failed);
    }

    fn execute(&mut self, cbw: CommandBlockWrapper) {
        let tag = cbw.tag;
        let lun_index = cbw.lun as usize;
        let Some(lun) = self.luns.get(lun_index).cloned() else {
            self.fail(&cbw, illegal_request());
            return;
        };
        let cdb = cbw.cdb().to_vec();
        let not_ready = Sense {
            key: scsi::SENSE_NOT_READY,
            asc: scsi::ASC_MEDIUM_NOT_PRESENT,
            ascq: 0,
        };

        match cdb[0] {
            scsi::INQUIRY => {
                let mut raw = [0u8; scsi::INQUIRY_LEN];
                raw[8..16].copy_from_slice(b"Fake    ");
                raw[16..32].copy_from_slice(b"Stick           ");
                self.responses.push_back(raw.to_vec());
                self.status(tag, CommandStatus::Passed);
            }
            scsi::REQUEST_SENSE => {
                let sense = std::mem::take(&mut self.sense);
                self.responses.push_back(sense.to_bytes().to_vec());
                self.status(tag, CommandStatus::Passed);
            }
            _ if !lun.present => self.fail(&cbw, not_ready),
            scsi::TEST_UNIT_READY => {
                if lun.unit_attentions > 0 {
                    self.luns[lun_index].unit_attentions -= 1;
                    self.fail(
                        &cbw,
                        Sense {
                            key: scsi::SENSE_UNIT_ATTENTION,
                            asc: 0x28,
                            ascq: 0,
                        },
                    );
                } else {
                    self.status(tag, CommandStatus::Passed);
                }
            }
            scsi::READ_CAPACITY_10 => {
                let last = lun.blocks - 1;
                let last = u32::try_from(last).unwrap_or(u32::MAX);
                let mut raw = Vec::with_capacity(8);
                raw.extend_from_slice(&last.to_be_bytes());
                raw.extend_from_slice(&lun.block_size.to_be_bytes());
                self.responses.push_back(raw);
                self.status(tag, CommandStatus::Passed);
            }
            scsi::SERVICE_ACTION_IN_16 => {
                let mut raw = vec![0u8; scsi::READ_CAPACITY_16_LEN];
                raw[0..8].copy_from_slice(&(lun.blocks - 1).to_be_bytes());
                raw[8..12].copy_from_slice(&lun.block_size.to_be_bytes());
                self.responses.push_back(raw);
                self.status(tag, CommandStatus::Passed);
            }
            scsi::READ_10 | scsi::READ_16 => {
                let (lba, count) = scsi::parse_read_write(&cdb).unwrap();
                if lba + u64::from(count) > lun.blocks {
                    self.fail(&cbw, illegal_request());
                    return;
                }
                let len = count as usize * lun.block_size as usize;
                self.responses.push_back(lun.bytes(lba, len));
                self.status(tag, CommandStatus::Passed);
            }
            scsi::WRITE_10 | scsi::WRITE_16 => {
                let (lba, count) = scsi::parse_read_write(&cdb).unwrap();
                assert_eq!(cbw.data_len, count * lun.block_size, "CBW length disagrees with CDB");
                self.pending = Some(PendingWrite {
                    lun: cbw.lun,
                    lba,
                    tag,
                    expected: cbw.data_len as usize,
                    data: Vec::new(),
                });
            }
            _ => self.fail(&cbw, illegal_request()),
        }
    }

    fn complete_write(&mut self, pending: PendingWrite) {
        let lun = &mut self.luns[pending.lun as usize];
        let bs = lun.block_size as usize;
        let count = pending.data.len() / bs;
        for (i, sector) in pending.data.chunks(bs).enumerate() {
            lun.sectors.insert(pending.lba + i as u64, sector.to_vec());
        }
        self.writes.push((pending.lun, pending.lba, count as u32));
        self.status(pending.tag, CommandStatus::Passed);
    }
}

fn illegal_request() -> Sense {
    Sense {
        key: 0x05,
        asc: 0x20,
        ascq: 0,
    }
}

/// A host with exactly one bulk-only stick attached.
#[derive(Clone)]
pub struct FakeHost {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeHost {
    pub fn new(luns: Vec<FakeLun>) -> Self {
        let max_lun = Some((luns.len() - 1) as u8);
        FakeHost {
            state: Arc::new(Mutex::new(FakeState {
                luns,
                max_lun,
                permitted: true,
                revoke_after_writes: None,
                claims: 0,
                closes: 0,
                control_transfers: 0,
                bulk_transfers: 0,
                writes: Vec::new(),
                sense: Sense::default(),
                responses: VecDeque::new(),
                pending: None,
            })),
        }
    }

    /// A single-LUN stick of `blocks` 512-byte sectors.
    pub fn stick(blocks: u64) -> Self {
        Self::new(vec![FakeLun::new(blocks)])
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn id() -> DeviceId {
        DeviceId(STICK_ID.to_string())
    }
}

impl UsbHost for FakeHost {
    fn devices(&self) -> io::Result<Vec<UsbDeviceInfo>> {
        Ok(vec![UsbDeviceInfo {
            id: Self::id(),
            vendor_id: 0x0781,
            product_id: 0x5581,
            manufacturer: Some("SanDisk".to_string()),
            product: Some("Ultra".to_string()),
            interfaces: vec![InterfaceInfo {
                number: INTERFACE,
                class: 0x08,
                subclass: 0x06,
                protocol: 0x50,
                endpoints: vec![
                    EndpointInfo {
                        address: EP_IN,
                        transfer_type: TransferType::Bulk,
                    },
                    EndpointInfo {
                        address: EP_OUT,
                        transfer_type: TransferType::Bulk,
                    },
                ],
            }],
        }])
    }

    fn has_permission(&self, id: &DeviceId) -> bool {
        *id == Self::id() && self.state().permitted
    }

    fn claim(&self, id: &DeviceId, request: ClaimRequest) -> io::Result<Box<dyn UsbChannel>> {
        assert_eq!(*id, Self::id());
        assert_eq!(
            (request.interface, request.endpoint_in, request.endpoint_out),
            (INTERFACE, EP_IN, EP_OUT)
        );
        self.state().claims += 1;
        Ok(Box::new(FakeChannel {
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct FakeChannel {
    state: Arc<Mutex<FakeState>>,
    closed: bool,
}

impl FakeChannel {
    fn lock(&self) -> io::Result<MutexGuard<'_, FakeState>> {
        assert!(!self.closed, "transfer on a released interface");
        let state = self.state.lock().unwrap();
        if !state.permitted {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "USB permission revoked",
            ));
        }
        Ok(state)
    }
}

impl UsbChannel for FakeChannel {
    fn control_in(&mut self, request: ControlRequest, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock()?;
        state.control_transfers += 1;
        assert_eq!(request.request_type, bot::REQUEST_TYPE_CLASS_IN);
        assert_eq!(request.request, bot::REQUEST_GET_MAX_LUN);
        assert_eq!(request.index, u16::from(INTERFACE));
        match state.max_lun {
            Some(max) => {
                buf[0] = max;
                Ok(1)
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "endpoint stalled")),
        }
    }

    fn bulk_out(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.lock()?;
        state.bulk_transfers += 1;
        if let Some(mut pending) = state.pending.take() {
            pending.data.extend_from_slice(data);
            assert!(pending.data.len() <= pending.expected, "data phase overrun");
            if pending.data.len() == pending.expected {
                state.complete_write(pending);
            } else {
                state.pending = Some(pending);
            }
            return Ok(data.len());
        }
        if state
            .revoke_after_writes
            .is_some_and(|limit| state.writes.len() >= limit)
        {
            state.permitted = false;
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "USB permission revoked",
            ));
        }
        let cbw = CommandBlockWrapper::parse(data)
            .expect("bulk OUT outside a data phase must be a CBW");
        state.execute(cbw);
        Ok(data.len())
    }

    fn bulk_in(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock()?;
        state.bulk_transfers += 1;
        let Some(packet) = state.responses.pop_front() else {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "nothing to read"));
        };
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    fn close(&mut self) {
        assert!(!self.closed, "interface released twice");
        self.closed = true;
        self.state.lock().unwrap().closes += 1;
    }
}

/// A plain in-memory disk.
pub struct MemoryDisk {
    pub data: Vec<u8>,
    pub block_size: u32,
    pub closes: Arc<Mutex<usize>>,
    /// Writes issued, as `(sector, len)`.
    pub writes: Vec<(u64, usize)>,
}

impl MemoryDisk {
    pub fn new(blocks: u64) -> Self {
        MemoryDisk {
            data: vec![0; blocks as usize * 512],
            block_size: 512,
            closes: Arc::new(Mutex::new(0)),
            writes: Vec::new(),
        }
    }
}

impl BlockDevice for MemoryDisk {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn blocks(&self) -> u64 {
        (self.data.len() / self.block_size as usize) as u64
    }

    fn read(&mut self, sector: u64, count: u32) -> io::Result<Vec<u8>> {
        let start = sector as usize * self.block_size as usize;
        let end = start + count as usize * self.block_size as usize;
        Ok(self.data[start..end].to_vec())
    }

    fn write(&mut self, sector: u64, buf: &[u8]) -> io::Result<()> {
        stickr_core::block::ensure_whole_sectors(buf.len(), self.block_size)?;
        let start = sector as usize * self.block_size as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        self.writes.push((sector, buf.len()));
        Ok(())
    }

    fn close(&mut self) {
        *self.closes.lock().unwrap() += 1;
    }
}

/// Counts writes without storing anything; any size is free.
pub struct CountingDisk {
    pub blocks: u64,
    pub log: Arc<Mutex<CountingLog>>,
}

#[derive(Debug, Default)]
pub struct CountingLog {
    pub writes: usize,
    pub bytes: u64,
    pub next_sector: u64,
    pub closes: usize,
}

impl CountingDisk {
    pub fn new(blocks: u64) -> (Self, Arc<Mutex<CountingLog>>) {
        let log = Arc::new(Mutex::new(CountingLog::default()));
        (
            CountingDisk {
                blocks,
                log: log.clone(),
            },
            log,
        )
    }
}

impl BlockDevice for CountingDisk {
    fn block_size(&self) -> u32 {
        512
    }

    fn blocks(&self) -> u64 {
        self.blocks
    }

    fn read(&mut self, _sector: u64, count: u32) -> io::Result<Vec<u8>> {
        Ok(vec![0; count as usize * 512])
    }

    fn write(&mut self, sector: u64, buf: &[u8]) -> io::Result<()> {
        stickr_core::block::ensure_whole_sectors(buf.len(), 512)?;
        let mut log = self.log.lock().unwrap();
        assert_eq!(sector, log.next_sector, "writes must be sequential");
        log.next_sector += (buf.len() / 512) as u64;
        log.writes += 1;
        log.bytes += buf.len() as u64;
        Ok(())
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closes += 1;
    }
}

/// Clears `running` once `limit` bytes have been handed out.
pub struct StopAfter<'a, R> {
    pub inner: R,
    pub limit: u64,
    pub read: u64,
    pub running: &'a AtomicBool,
}

impl<'a, R> StopAfter<'a, R> {
    pub fn new(inner: R, limit: u64, running: &'a AtomicBool) -> Self {
        StopAfter {
            inner,
            limit,
            read: 0,
            running,
        }
    }
}

impl<R: Read> Read for StopAfter<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        if self.read >= self.limit {
            self.running.store(false, Ordering::SeqCst);
        }
        Ok(n)
    }
}

/// Fails every read once `limit` bytes have been handed out.
pub struct FailAfter<R> {
    pub inner: R,
    pub limit: u64,
    pub read: u64,
}

impl<R> FailAfter<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        FailAfter {
            inner,
            limit,
            read: 0,
        }
    }
}

impl<R: Read> Read for FailAfter<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.read >= self.limit {
            return Err(io::Error::other("archive truncated"));
        }
        let room = (self.limit - self.read) as usize;
        let len = buf.len().min(room);
        let n = self.inner.read(&mut buf[..len])?;
        self.read += n as u64;
        Ok(n)
    }
}
